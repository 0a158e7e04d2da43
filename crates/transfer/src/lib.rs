//! Client-side transfer primitives.
//!
//! A file becomes a content fingerprint plus an ordered list of fixed-size
//! chunk ranges. The fingerprint groups chunks on the server; the range
//! plan is deterministic so indices stay stable across retries and resumed
//! sessions.

mod fingerprint;
mod session;
mod split;

pub use fingerprint::{Fingerprinter, fingerprint_bytes, fingerprint_file};
pub use session::{UploadSession, UploadState};
pub use split::{ChunkRange, ChunkReader, plan_chunks};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file changed during transfer: expected {expected} bytes at offset {offset}, got {got}")]
    ShortRead {
        offset: u64,
        expected: u64,
        got: u64,
    },
}
