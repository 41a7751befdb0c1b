//! Capability registry.
//!
//! Static map of capability name -> operation name -> operation,
//! built once from a definition and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use capsa_core::{EngineError, EngineResult};

use crate::definition::Capability;
use crate::definition::Operation;
use crate::describe::{CapabilityDescription, OperationDescription};

struct CapabilityEntry {
    operations: HashMap<String, Arc<Operation>>,
}

/// Read-only lookup table for a capsule's operations.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, CapabilityEntry>,
    descriptions: Vec<CapabilityDescription>,
}

impl CapabilityRegistry {
    /// Build a registry, validating name uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidDefinition`] on duplicate
    /// capability or operation names.
    pub fn new(capabilities: Vec<Capability>) -> EngineResult<Self> {
        let mut map = HashMap::new();
        let mut descriptions = Vec::with_capacity(capabilities.len());

        for capability in capabilities {
            let mut operations = HashMap::new();
            let mut op_descriptions = Vec::with_capacity(capability.operations.len());

            for operation in capability.operations {
                op_descriptions.push(OperationDescription {
                    name: operation.name.clone(),
                    docs: operation.docs.clone(),
                    kind: operation.kind(),
                });
                let name = operation.name.clone();
                if operations.insert(name.clone(), Arc::new(operation)).is_some() {
                    return Err(EngineError::InvalidDefinition {
                        message: format!(
                            "duplicate operation {}.{name}",
                            capability.name
                        ),
                    });
                }
            }

            descriptions.push(CapabilityDescription {
                name: capability.name.clone(),
                docs: capability.docs.clone(),
                operations: op_descriptions,
            });

            if map
                .insert(capability.name.clone(), CapabilityEntry { operations })
                .is_some()
            {
                return Err(EngineError::InvalidDefinition {
                    message: format!("duplicate capability {}", capability.name),
                });
            }
        }

        Ok(Self {
            capabilities: map,
            descriptions,
        })
    }

    /// Look up an operation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownCapability`] or
    /// [`EngineError::UnknownOperation`] when absent.
    pub fn operation(&self, capability: &str, operation: &str) -> EngineResult<Arc<Operation>> {
        let entry = self
            .capabilities
            .get(capability)
            .ok_or_else(|| EngineError::UnknownCapability {
                capability: capability.to_string(),
            })?;
        entry
            .operations
            .get(operation)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOperation {
                capability: capability.to_string(),
                operation: operation.to_string(),
            })
    }

    /// Capability descriptions in definition order.
    #[must_use]
    pub fn descriptions(&self) -> &[CapabilityDescription] {
        &self.descriptions
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Capability, Operation};
    use serde_json::json;

    fn math() -> Capability {
        Capability::new("math")
            .operation(Operation::call("add", |ctx| async move { Ok(ctx.params) }))
    }

    #[test]
    fn lookup_known_operation() {
        let registry = CapabilityRegistry::new(vec![math()]).unwrap();
        let op = registry.operation("math", "add").unwrap();
        assert_eq!(op.name(), "add");
    }

    #[test]
    fn unknown_capability_and_operation() {
        let registry = CapabilityRegistry::new(vec![math()]).unwrap();

        let err = registry.operation("files", "read").unwrap_err();
        assert!(matches!(err, EngineError::UnknownCapability { .. }));

        let err = registry.operation("math", "mod").unwrap_err();
        assert!(matches!(err, EngineError::UnknownOperation { .. }));
    }

    #[test]
    fn duplicate_operation_rejected() {
        let capability = Capability::new("math")
            .operation(Operation::call("add", |ctx| async move { Ok(ctx.params) }))
            .operation(Operation::call("add", |_ctx| async move { Ok(json!(0)) }));

        let err = CapabilityRegistry::new(vec![capability]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition { .. }));
    }

    #[test]
    fn duplicate_capability_rejected() {
        let err = CapabilityRegistry::new(vec![math(), math()]).unwrap_err();
        assert!(err.to_string().contains("duplicate capability"));
    }

    #[test]
    fn descriptions_preserve_order() {
        let registry = CapabilityRegistry::new(vec![
            Capability::new("b").operation(Operation::call("x", |ctx| async move {
                Ok(ctx.params)
            })),
            Capability::new("a").operation(Operation::call("y", |ctx| async move {
                Ok(ctx.params)
            })),
        ])
        .unwrap();

        let names: Vec<_> = registry.descriptions().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
