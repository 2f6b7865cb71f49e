//! Error types for the stream engine.

use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for engine operations.
///
/// Engine code propagates these with `?`; the protocol front-end is the only
/// place they are turned into HTTP statuses and JSON bodies.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("stream not found: {path}")]
    NotFound { path: String },

    #[error("stream already exists with different configuration")]
    ConflictExists,

    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("sequence conflict: {message}")]
    SequenceConflict { message: String },

    #[error("stale producer epoch: current epoch is {current_epoch}")]
    StaleEpoch { current_epoch: u64 },

    #[error("invalid request: {message}")]
    BadRequest { message: String },

    #[error("offset gone (retention): {offset}")]
    OffsetGone { offset: String },

    #[error("precondition failed: head is {head}")]
    PreconditionFailed { head: String },

    #[error("rate limited")]
    RateLimited,

    #[error("empty append not allowed")]
    EmptyAppend,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        EngineError::BadRequest {
            message: message.into(),
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound { .. } => 404,
            EngineError::ConflictExists => 409,
            EngineError::SequenceGap { .. } => 409,
            EngineError::SequenceConflict { .. } => 409,
            EngineError::StaleEpoch { .. } => 403,
            EngineError::BadRequest { .. } => 400,
            EngineError::EmptyAppend => 400,
            EngineError::OffsetGone { .. } => 410,
            EngineError::PreconditionFailed { .. } => 412,
            EngineError::RateLimited => 429,
            EngineError::Storage(_) => 500,
        }
    }

    /// Stable error code string for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::ConflictExists => "conflict",
            EngineError::SequenceGap { .. } => "sequence_gap",
            EngineError::SequenceConflict { .. } => "sequence_conflict",
            EngineError::StaleEpoch { .. } => "stale_epoch",
            EngineError::BadRequest { .. } => "bad_request",
            EngineError::EmptyAppend => "empty_append",
            EngineError::OffsetGone { .. } => "offset_gone",
            EngineError::PreconditionFailed { .. } => "precondition_failed",
            EngineError::RateLimited => "rate_limited",
            EngineError::Storage(_) => "internal",
        }
    }

    /// JSON body for error responses.
    ///
    /// Sequence and epoch errors carry the fields clients recover from:
    /// `{expected, received}` and `{currentEpoch}`.
    pub fn body(&self) -> serde_json::Value {
        match self {
            EngineError::SequenceGap { expected, received } => json!({
                "error": self.code(),
                "expected": expected,
                "received": received,
            }),
            EngineError::StaleEpoch { current_epoch } => json!({
                "error": self.code(),
                "currentEpoch": current_epoch,
            }),
            other => json!({
                "error": other.code(),
                "message": other.to_string(),
            }),
        }
    }
}
