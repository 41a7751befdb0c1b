//! Capability dispatch engine.
//!
//! A capsule exposes named, schema-free operations grouped into
//! capabilities. [`Capsule`] owns the lifecycle state machine, runs
//! boot/shutdown hooks, executes [`Capsule::trigger`] through the
//! middleware pipeline and the capability registry, tracks in-flight
//! cancellation tokens, and drives the stimulus bus.

pub mod capsule;
pub mod definition;
pub mod describe;
pub mod middleware;
pub mod registry;

pub use capsule::{Capsule, Emitter, TriggerReply, ValueStream};
pub use definition::{
    Capability, CapsuleDefinition, HookContext, Operation, OperationContext, OperationKind,
};
pub use describe::{CapabilityDescription, CapsuleDescription, OperationDescription};
pub use middleware::{middleware_fn, InvocationContext, Middleware, MiddlewareDecision};

pub use capsa_core::{
    CancelRegistration, CancelToken, CapsuleState, EngineError, EngineResult, RequestId,
};
pub use capsa_events::{Stimulus, StimulusBus, StimulusSource, Subscription};
