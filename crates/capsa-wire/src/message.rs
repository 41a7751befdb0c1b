//! Protocol message taxonomy.
//!
//! Messages are split by direction because the wire format reuses the
//! `"boot"` and `"shutdown"` type tags for both a request and its
//! response: a [`ClientMessage`] travels caller -> runner, a
//! [`ServerMessage`] travels runner -> caller, and within each
//! direction every `type` tag is unique.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use capsa_core::RequestId;
use capsa_engine::CapsuleDescription;
use capsa_events::{Stimulus, StimulusSource};

use crate::error::{WireError, WireResult};

/// Messages sent by the caller side (Remote Facade) to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Boot the remote capsule.
    Boot {
        /// Name of the capsule being booted. Optional; a runner hosts
        /// exactly one capsule and may accept a nameless boot.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capsule_name: Option<String>,
    },
    /// Invoke an operation.
    Trigger {
        /// Correlation id, unique per connection.
        id: RequestId,
        /// Target capability.
        capability: String,
        /// Target operation.
        operation: String,
        /// Opaque invocation params.
        params: Value,
        /// Snapshot of the caller token's cancelled flag at send time.
        #[serde(default)]
        signal_aborted: bool,
    },
    /// Cancel an in-flight trigger. No direct response.
    Abort {
        /// Id of the trigger to cancel.
        id: RequestId,
        /// Cancellation reason.
        reason: String,
    },
    /// Shut the remote capsule down.
    Shutdown,
}

/// Messages sent by the runner back to the caller side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Answer to [`ClientMessage::Boot`].
    #[serde(rename = "boot")]
    BootResponse {
        /// Whether the capsule booted.
        ready: bool,
        /// Static capsule metadata, present when ready.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<CapsuleDescription>,
        /// Failure description, present when not ready.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Single result of a `call` trigger.
    Response {
        /// Correlation id of the trigger.
        id: RequestId,
        /// The result, on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// The failure, on error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One item of a `stream` trigger's sequence.
    StreamData {
        /// Correlation id of the trigger.
        id: RequestId,
        /// The item.
        data: Value,
    },
    /// Terminates a `stream` trigger's sequence.
    StreamEnd {
        /// Correlation id of the trigger.
        id: RequestId,
        /// Present when iteration failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Unsolicited stimulus forwarded from the remote capsule.
    Stimulus {
        /// Sense tag.
        sense: String,
        /// Opaque payload.
        data: Value,
        /// Provenance, absent for lifecycle-hook emissions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<StimulusSource>,
        /// Emission time on the remote side.
        timestamp: DateTime<Utc>,
    },
    /// Answer to [`ClientMessage::Shutdown`]. Once sent, the runner's
    /// last output.
    #[serde(rename = "shutdown")]
    ShutdownResponse {
        /// Whether shutdown succeeded.
        ok: bool,
        /// Failure description when not ok.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerMessage {
    /// Wrap a stimulus for the wire, stamping the timestamp if the
    /// emitting side left it absent.
    #[must_use]
    pub fn from_stimulus(stimulus: &Stimulus) -> Self {
        Self::Stimulus {
            sense: stimulus.sense.clone(),
            data: stimulus.data.clone(),
            source: stimulus.source.clone(),
            timestamp: stimulus.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// Decode a typed message from an already-parsed JSON line.
///
/// # Errors
///
/// Returns [`WireError::Malformed`] when the value is not a valid
/// message of the expected direction.
pub fn decode_message<T: DeserializeOwned>(value: Value) -> WireResult<T> {
    serde_json::from_value(value).map_err(WireError::Malformed)
}
