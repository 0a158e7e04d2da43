use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::TransferError;

/// Read buffer for streaming digests; memory use is independent of file size.
const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental content fingerprint accumulator.
///
/// Identical bytes always produce the same fingerprint, regardless of file
/// name or modification time — that is what makes resume and dedup safe.
/// Feed it with [`update`](Self::update) and call
/// [`finalize`](Self::finalize) once all bytes have been read.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Absorbs the next slice of file bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Consumes the accumulator and returns the hex-encoded fingerprint.
    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the fingerprint of a byte slice.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut fp = Fingerprinter::new();
    fp.update(data);
    fp.finalize()
}

/// Computes the fingerprint of an entire file by streaming it through a
/// fixed-size buffer.
pub fn fingerprint_file(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut fp = Fingerprinter::new();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        fp.update(&buf[..n]);
    }
    Ok(fp.finalize())
}
