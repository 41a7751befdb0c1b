//! Capsule lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a capsule.
///
/// The state machine is monotonic and one-way:
/// `Created -> Booted -> Shutdown`. A capsule is never resurrected;
/// callers that need a fresh instance construct a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleState {
    /// Constructed but not yet booted. `trigger` is not available.
    Created,
    /// Boot hook completed; operations may be triggered.
    Booted,
    /// Shut down. Terminal; no further transitions.
    Shutdown,
}

impl std::fmt::Display for CapsuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Booted => write!(f, "booted"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!(CapsuleState::Created.to_string(), "created");
        assert_eq!(CapsuleState::Booted.to_string(), "booted");
        assert_eq!(CapsuleState::Shutdown.to_string(), "shutdown");
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&CapsuleState::Booted).unwrap();
        assert_eq!(json, "\"booted\"");
        let back: CapsuleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CapsuleState::Booted);
    }
}
