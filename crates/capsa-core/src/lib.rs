//! Core types shared across the Capsa runtime.
//!
//! This crate holds the pieces every other Capsa crate builds on: the
//! capsule lifecycle state machine, request identifiers, the error
//! taxonomy raised by the dispatch engine, and the cooperative
//! cancellation token that threads through every in-flight operation.

pub mod cancel;
pub mod error;
pub mod id;
pub mod state;

pub use cancel::{CancelRegistration, CancelToken};
pub use error::{EngineError, EngineResult};
pub use id::RequestId;
pub use state::CapsuleState;
