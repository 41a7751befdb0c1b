//! Wire-level errors.

use thiserror::Error;

/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// A message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A line parsed as JSON but is not a valid protocol message.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
