//! Stimulus value types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a stimulus came from.
///
/// Absent for lifecycle-hook emissions, which are bound to no
/// particular operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusSource {
    /// Capability that emitted the stimulus.
    pub capability: String,
    /// Operation that emitted the stimulus.
    pub operation: String,
}

impl std::fmt::Display for StimulusSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.capability, self.operation)
    }
}

/// An event emitted by a capsule.
///
/// Stimuli are ephemeral: the bus delivers them to currently registered
/// listeners and keeps nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    /// Sense tag, e.g. `"progress"` or `"lifecycle.booted"`.
    pub sense: String,
    /// Opaque payload.
    pub data: Value,
    /// Provenance, when emitted from within an operation handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StimulusSource>,
    /// Stamped by the emitting capsule if absent. Monotonic enough to
    /// order stimuli within one process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Stimulus {
    /// Create a sourceless stimulus with no timestamp.
    #[must_use]
    pub fn new(sense: impl Into<String>, data: Value) -> Self {
        Self {
            sense: sense.into(),
            data,
            source: None,
            timestamp: None,
        }
    }

    /// Attach a source.
    #[must_use]
    pub fn with_source(mut self, capability: impl Into<String>, operation: impl Into<String>) -> Self {
        self.source = Some(StimulusSource {
            capability: capability.into(),
            operation: operation.into(),
        });
        self
    }

    /// Stamp the current time if no timestamp is set.
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }
}
