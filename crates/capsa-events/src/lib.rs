//! In-process pub/sub for capsule stimuli.
//!
//! A stimulus is an asynchronous event emitted by a capsule,
//! independent of any particular trigger's response. The bus fans each
//! stimulus out to every registered listener in registration order.

pub mod bus;
pub mod stimulus;

pub use bus::{StimulusBus, Subscription};
pub use stimulus::{Stimulus, StimulusSource};
