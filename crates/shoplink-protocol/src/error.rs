//! Errors raised while decoding realtime frames.

use thiserror::Error;

/// Why an inbound text frame could not be turned into an [`Envelope`](crate::Envelope).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The frame is JSON, but not an object.
    #[error("frame is not a JSON object (got {0})")]
    NotAnObject(&'static str),

    /// The object has no string `type` field.
    #[error("frame has no string `type` field")]
    MissingType,
}

impl ProtocolError {
    /// Short stable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::NotAnObject(_) => "not_an_object",
            Self::MissingType => "missing_type",
        }
    }
}
