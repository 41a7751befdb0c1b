//! Transport bridging for Capsa capsules.
//!
//! The server side ([`ProtocolRunner`]) drives one dispatch engine
//! from wire messages; the client side ([`RemoteCapsule`]) presents a
//! remote engine behind the same contract a local [`capsa_engine::Capsule`]
//! offers. Between them sits a line-delimited JSON protocol carried
//! over any byte-stream transport: an in-memory pipe, a spawned
//! subprocess, or a remote-shell command.

pub mod bridge;
pub mod error;
pub mod facade;
pub mod runner;
pub mod transport;

pub use bridge::{BridgeStream, StreamBridge};
pub use error::{RemoteError, RemoteResult};
pub use facade::{RemoteCapsule, RemoteReply};
pub use runner::ProtocolRunner;
pub use transport::{ChildProcessTransport, PipeTransport, Transport, TransportIo};
