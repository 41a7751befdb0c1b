//! Wire protocol for remote capsules.
//!
//! One JSON value per newline-terminated line carries the dispatch
//! engine's behavior across a transport boundary. The protocol exists
//! solely to make a remote capsule indistinguishable from a local one:
//! trigger/response correlation, streaming results, stimulus fan-out
//! and cooperative abort all survive serialization here.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{encode_line, LineDecoder};
pub use error::{WireError, WireResult};
pub use message::{decode_message, ClientMessage, ServerMessage};
