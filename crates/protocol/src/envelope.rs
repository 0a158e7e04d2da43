use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details attached to an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
}

/// Envelope for all client-server communication.
///
/// The `payload` field uses `serde_json::value::RawValue` so payloads are
/// only deserialized once the message type is known. A message may carry
/// both an error and a payload: the merge mismatch response uses the
/// payload to report structured expected/actual counts next to the error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
            error: None,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates an error message.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(ErrorDetail {
                code,
                message: message.into(),
            }),
        }
    }

    /// Creates an error message carrying a structured detail payload.
    pub fn error_with_payload<T: Serialize>(
        id: impl Into<String>,
        code: i32,
        message: impl Into<String>,
        detail: &T,
    ) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(detail)?;
        Ok(Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: Some(serde_json::value::RawValue::from_string(json)?),
            error: Some(ErrorDetail {
                code,
                message: message.into(),
            }),
        })
    }

    /// Creates a response message for this request (same id).
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(&self.id, code, message)
    }
}
