//! Errors raised on the remote path.

use thiserror::Error;

use capsa_core::EngineError;
use capsa_wire::WireError;

/// Errors a caller of a remote capsule can observe.
///
/// Local contract violations (wrong lifecycle state, unknown
/// operation, pre-cancelled token) surface as the same
/// [`EngineError`] values a local capsule raises, so caller code can
/// branch identically on both paths.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The same failure a local engine would raise.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The remote side reported a failure for this request.
    #[error("remote failure: {message}")]
    Remote {
        /// The error text carried on the wire
        message: String,
    },

    /// The peer violated the protocol.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was violated
        message: String,
    },

    /// The underlying stream ended or errored unexpectedly. Once this
    /// is observed the facade is permanently unusable.
    #[error("transport failed: {message}")]
    Transport {
        /// What happened to the transport
        message: String,
    },

    /// Transport-level I/O failure.
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
    },

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl RemoteError {
    /// Shorthand for a transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use capsa_core::CapsuleState;

    #[test]
    fn engine_errors_pass_through_transparently() {
        let err = RemoteError::from(EngineError::lifecycle(CapsuleState::Created, "trigger"));
        assert_eq!(err.to_string(), "capsule is created: cannot trigger");
        assert!(matches!(err, RemoteError::Engine(_)));
    }

    #[test]
    fn remote_failures_carry_the_wire_text() {
        let err = RemoteError::Remote {
            message: "rejected by middleware: Unauthorized".into(),
        };
        assert!(err.to_string().contains("Unauthorized"));
    }
}
