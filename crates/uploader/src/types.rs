use std::path::PathBuf;

use barge_transfer::UploadState;

/// One file to upload.
#[derive(Debug, Clone)]
pub struct UploadSpec {
    pub file_path: PathBuf,
    /// Server-side artifact name (a single path component).
    pub artifact_name: String,
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Chunk size in bytes; 0 selects the protocol default.
    pub chunk_size: u64,
    /// Upper bound on chunks in flight per file.
    pub max_concurrent_chunks: usize,
    /// Attach a per-chunk SHA-256 checksum for server-side verification.
    pub with_checksums: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            max_concurrent_chunks: 4,
            with_checksums: false,
        }
    }
}

/// Progress event emitted during an upload batch.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress {
        upload_id: String,
        artifact_name: String,
        state: UploadState,
        /// 0.0 to 100.0, weighted by chunk count.
        progress: f64,
    },
    Completed {
        upload_id: String,
        location: String,
    },
    Failed {
        upload_id: String,
        error: String,
    },
    Cancelled {
        upload_id: String,
    },
}

/// Result of one file's upload attempt.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub upload_id: String,
    pub artifact_name: String,
    pub state: UploadState,
    pub location: Option<String>,
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn success(&self) -> bool {
        matches!(self.state, UploadState::Success | UploadState::FastSuccess)
    }
}
