//! Framed TCP transport for chunk uploads.
//!
//! Every exchange starts with a length-prefixed JSON envelope; a `chunk`
//! envelope is followed by exactly `size` raw body bytes, so the receiver
//! knows where the chunk lands before touching the payload. All other
//! message types are envelope-only.

pub mod client;
pub mod server;
pub mod wire;

pub use client::UploadChannel;
pub use server::UploadServer;

/// Errors produced by the upload channel (both sides).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an error envelope.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
