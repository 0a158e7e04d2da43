use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size: 5 MiB.
///
/// The splitter falls back to this when the caller passes 0. Both sides
/// tolerate any chunk size up to [`MAX_CHUNK_SIZE`]; the partition only
/// has to stay constant within one fingerprint.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Hard upper bound for a single chunk payload (64 MiB).
///
/// A chunk header declaring more than this is rejected before any byte of
/// the body is read.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum accepted envelope header length in a frame (64 KiB).
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Copy buffer used when streaming chunk bodies and merge output.
pub const IO_BUFFER_SIZE: usize = 256 * 1024;

/// Time allowed to establish a TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for small request/response exchanges (status, merge ack, cleanup).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for one full chunk body to cross the wire.
pub const CHUNK_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on a single merge pass.
///
/// Merges stream every stored chunk into the destination artifact, so this
/// scales with artifact size; the default is generous for multi-GiB files
/// on local disks.
pub const MERGE_TIMEOUT: Duration = Duration::from_secs(600);

// Error codes carried in envelope errors.

/// Required identifier missing or malformed.
pub const CODE_BAD_REQUEST: i32 = 400;
/// Stored chunk count does not match the declared total at merge time.
pub const CODE_COUNT_MISMATCH: i32 = 409;
/// Declared chunk size exceeds [`MAX_CHUNK_SIZE`].
pub const CODE_CHUNK_TOO_LARGE: i32 = 413;
/// A merge for this fingerprint is in progress; late writes are rejected.
pub const CODE_MERGE_IN_PROGRESS: i32 = 423;
/// Operation was cancelled; server state rolled back to last consistent point.
pub const CODE_CANCELLED: i32 = 499;
/// Storage-layer failure; rolled back, safe to retry.
pub const CODE_INTERNAL: i32 = 500;

/// Message type identifier for the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "chunk")]
    Chunk,
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "cleanup")]
    Cleanup,

    // Responses from server to client
    #[serde(rename = "status_response")]
    StatusResponse,
    #[serde(rename = "chunk_response")]
    ChunkResponse,
    #[serde(rename = "merge_response")]
    MergeResponse,
    #[serde(rename = "operation_result")]
    OperationResult,
    #[serde(rename = "error")]
    Error,
}
