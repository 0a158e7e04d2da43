use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use barge_protocol::constants::DEFAULT_CHUNK_SIZE;

use crate::TransferError;

/// One ordered byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// 0-based, contiguous, unique within a fingerprint.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length in bytes; only the last chunk may be shorter than the chunk size.
    pub len: u64,
}

/// Partitions `file_size` bytes into fixed-size ranges.
///
/// Range `i` covers `[i*size, min((i+1)*size, file_size))`. The function is
/// pure: calling it again with the same inputs yields the identical
/// partition, which keeps indices stable across retries and resumed
/// sessions. A `chunk_size` of 0 selects [`DEFAULT_CHUNK_SIZE`].
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let count = file_size.div_ceil(size);
    let mut ranges = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * size;
        ranges.push(ChunkRange {
            index: i as u32,
            offset,
            len: (file_size - offset).min(size),
        });
    }
    ranges
}

/// Reads arbitrary chunk ranges of a file by seeking.
///
/// Unlike a sequential reader this supports out-of-order and repeated reads,
/// which is what chunk retries need.
pub struct ChunkReader {
    file: std::fs::File,
}

impl ChunkReader {
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        Ok(Self {
            file: std::fs::File::open(path)?,
        })
    }

    /// Reads exactly one planned range.
    ///
    /// A short read means the file shrank after planning; that is surfaced
    /// as an error rather than silently uploading a truncated chunk.
    pub fn read_range(&mut self, range: &ChunkRange) -> Result<Vec<u8>, TransferError> {
        self.file.seek(SeekFrom::Start(range.offset))?;
        let mut buf = vec![0u8; range.len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(TransferError::ShortRead {
                    offset: range.offset,
                    expected: range.len,
                    got: filled as u64,
                });
            }
            filled += n;
        }
        Ok(buf)
    }
}
