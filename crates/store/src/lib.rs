//! Server-side chunk storage.
//!
//! Layout on disk:
//!
//! ```text
//! <artifacts_root>/<name>              completed artifacts, by name
//! <staging_root>/<fingerprint>/<index> one file per staged chunk
//! ```
//!
//! A staging directory exists iff at least one chunk for that fingerprint
//! has been received and not yet merged or cleaned up. An artifact is only
//! ever made visible by an atomic rename after a validated-complete merge,
//! and its staging directory is removed in the same operation.

mod store;
mod validate;

pub use store::{ArtifactStatus, ChunkStore, StagedChunk, StoreConfig};
pub use validate::validate_identifier;

/// Errors produced by the chunk store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} is required")]
    MissingIdentifier(&'static str),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("chunk too large: {size} bytes (max {max})")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("chunk body truncated: declared {declared} bytes, received {received}")]
    Truncated { declared: u64, received: u64 },

    #[error("chunk checksum mismatch")]
    ChecksumMismatch,

    #[error("merge in progress for fingerprint {0}")]
    MergeInProgress(String),

    #[error("chunk count mismatch: expected {expected}, stored {actual}")]
    CountMismatch { expected: u32, actual: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
