//! Wire protocol types shared by the Barge client and server.
//!
//! Every exchange is a JSON envelope ([`envelope::Message`]) carried in a
//! length-prefixed frame. Chunk uploads additionally stream raw payload
//! bytes immediately after the envelope, sized by the header, so the
//! receiver knows the staging destination before it reads the body.

pub mod constants;
pub mod envelope;
pub mod messages;

pub use constants::MessageType;
pub use envelope::{ErrorDetail, Message};
