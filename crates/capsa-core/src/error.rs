//! Error taxonomy for capsule dispatch.

use thiserror::Error;

use crate::state::CapsuleState;

/// Errors raised by the dispatch engine.
///
/// Every failure a caller can observe is a distinct variant so callers
/// can branch on "rejected by policy" vs "handler failed" vs
/// "cancelled" vs "wrong lifecycle state" without parsing strings.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The named capability is not present in the registry.
    #[error("unknown capability: {capability}")]
    UnknownCapability {
        /// The capability name that was not found
        capability: String,
    },

    /// The capability exists but has no operation with this name.
    #[error("unknown operation: {capability}.{operation}")]
    UnknownOperation {
        /// The capability that was looked up
        capability: String,
        /// The operation name that was not found
        operation: String,
    },

    /// The definition itself is malformed (duplicate names).
    #[error("invalid definition: {message}")]
    InvalidDefinition {
        /// What was wrong with the definition
        message: String,
    },

    /// The capsule is in the wrong lifecycle state for this call.
    #[error("capsule is {state}: cannot {action}")]
    Lifecycle {
        /// The capsule's current state
        state: CapsuleState,
        /// The call that was attempted
        action: String,
    },

    /// A middleware step explicitly rejected the invocation.
    #[error("rejected by middleware: {reason}")]
    Rejected {
        /// The reason supplied by the rejecting middleware
        reason: String,
    },

    /// A middleware step failed rather than deciding.
    #[error("middleware failed: {0}")]
    Middleware(anyhow::Error),

    /// The operation handler failed.
    ///
    /// The original error is preserved so callers can downcast.
    #[error("handler failed: {0}")]
    Handler(anyhow::Error),

    /// The operation was cancelled before or during execution.
    #[error("operation aborted: {reason}")]
    Aborted {
        /// The cancellation reason carried by the token
        reason: String,
    },
}

impl EngineError {
    /// Build a lifecycle error naming the current state.
    #[must_use]
    pub fn lifecycle(state: CapsuleState, action: impl Into<String>) -> Self {
        Self::Lifecycle {
            state,
            action: action.into(),
        }
    }

    /// True for abort-caused failures.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Result type for dispatch engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
