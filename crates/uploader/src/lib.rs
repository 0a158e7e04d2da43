//! Client-side upload orchestration.
//!
//! Takes local files through the full pipeline: fingerprint, server status
//! check, bounded-concurrency chunk upload (skipping chunks the server
//! already holds), and the final merge request. One cancellation token
//! covers the whole batch.

mod error;
mod orchestrator;
mod transport;
mod types;

pub use error::UploadError;
pub use orchestrator::UploadOrchestrator;
pub use transport::{ChannelTransport, Transport};
pub use types::{UploadConfig, UploadEvent, UploadOutcome, UploadSpec};
