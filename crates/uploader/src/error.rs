use barge_channel::ChannelError;
use barge_transfer::TransferError;

/// Errors produced while uploading a file.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload cancelled")]
    Cancelled,

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl UploadError {
    /// True when the error is a cancellation, locally or as reported by the
    /// server (code 499).
    pub fn is_cancelled(&self) -> bool {
        match self {
            UploadError::Cancelled => true,
            UploadError::Transport(ChannelError::Cancelled) => true,
            UploadError::Transport(ChannelError::Remote { code, .. }) => {
                *code == barge_protocol::constants::CODE_CANCELLED
            }
            _ => false,
        }
    }
}
