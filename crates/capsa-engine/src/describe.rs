//! Static capsule metadata.
//!
//! A description is valid before boot and stable across the whole
//! lifecycle. It is serializable so the wire layer can ship it in a
//! boot response and a remote facade can drive kind-aware dispatch
//! from it.

use serde::{Deserialize, Serialize};

use crate::definition::OperationKind;

/// Static metadata for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescription {
    /// Operation name, unique within its capability.
    pub name: String,
    /// Optional documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
    /// Whether the operation returns one value or a stream.
    pub kind: OperationKind,
}

/// Static metadata for one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescription {
    /// Capability name, unique within the capsule.
    pub name: String,
    /// Optional documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
    /// Operations, in definition order.
    pub operations: Vec<OperationDescription>,
}

/// Static metadata for a whole capsule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleDescription {
    /// Capsule name.
    pub name: String,
    /// Optional documentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<String>,
    /// Capabilities, in definition order.
    pub capabilities: Vec<CapabilityDescription>,
}

impl CapsuleDescription {
    /// Look up an operation's kind by capability and operation name.
    #[must_use]
    pub fn operation_kind(&self, capability: &str, operation: &str) -> Option<OperationKind> {
        self.capabilities
            .iter()
            .find(|c| c.name == capability)?
            .operations
            .iter()
            .find(|o| o.name == operation)
            .map(|o| o.kind)
    }

    /// Whether the named capability exists.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CapsuleDescription {
        CapsuleDescription {
            name: "demo".into(),
            docs: None,
            capabilities: vec![CapabilityDescription {
                name: "math".into(),
                docs: Some("arithmetic".into()),
                operations: vec![
                    OperationDescription {
                        name: "add".into(),
                        docs: None,
                        kind: OperationKind::Call,
                    },
                    OperationDescription {
                        name: "count".into(),
                        docs: None,
                        kind: OperationKind::Stream,
                    },
                ],
            }],
        }
    }

    #[test]
    fn kind_lookup() {
        let desc = sample();
        assert_eq!(
            desc.operation_kind("math", "add"),
            Some(OperationKind::Call)
        );
        assert_eq!(
            desc.operation_kind("math", "count"),
            Some(OperationKind::Stream)
        );
        assert_eq!(desc.operation_kind("math", "mod"), None);
        assert_eq!(desc.operation_kind("files", "add"), None);
    }

    #[test]
    fn serde_round_trip() {
        let desc = sample();
        let json = serde_json::to_string(&desc).unwrap();
        let back: CapsuleDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, back);
    }
}
