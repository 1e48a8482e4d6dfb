//! Errors raised while decoding cluster events off the wire.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The `event_type` tag names no known cluster event.
    #[error("unrecognized cluster event '{0}'")]
    UnknownEventType(String),

    #[error("malformed cluster event: {0}")]
    InvalidPayload(String),

    /// JSON encoding or decoding failed.
    #[error("cluster event JSON: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
