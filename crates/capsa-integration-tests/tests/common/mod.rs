//! Shared test harness for integration tests.
//!
//! Wires a protocol runner and a remote facade together over an
//! in-memory duplex pipe, so every test exercises the full path:
//! facade -> codec -> runner -> engine and back.

use std::sync::Arc;

use capsa_engine::{Capability, CapsuleDefinition, Operation};
use capsa_remote::{PipeTransport, ProtocolRunner, RemoteCapsule};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Install a per-test subscriber so engine and protocol traces land
/// in the captured test output. Safe to call repeatedly; only the
/// first call in a process wins.
#[allow(dead_code)]
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A runner serving a capsule on one end of a pipe and a booted
/// facade on the other.
#[allow(dead_code)]
pub struct RemotePair {
    /// The client-side facade, already booted.
    pub facade: Arc<RemoteCapsule>,
    /// Server-side capsule handle, for state assertions.
    pub capsule: Arc<capsa_engine::Capsule>,
    /// The serve loop; joins when the connection ends.
    pub runner_task: JoinHandle<()>,
}

/// Connect a facade to a runner hosting `definition` and boot it.
#[allow(dead_code)]
pub async fn connect(definition: CapsuleDefinition) -> RemotePair {
    let pair = connect_unbooted(definition);
    pair.facade.boot().await.expect("boot failed");
    pair
}

/// Connect without booting, for tests that drive boot themselves.
#[allow(dead_code)]
pub fn connect_unbooted(definition: CapsuleDefinition) -> RemotePair {
    init_tracing();
    let (client, server) = tokio::io::duplex(65536);

    let runner = ProtocolRunner::new(definition).expect("invalid definition");
    let capsule = Arc::clone(runner.capsule());
    let (server_read, server_write) = tokio::io::split(server);
    let runner_task = tokio::spawn(async move {
        runner
            .serve(server_read, server_write)
            .await
            .expect("serve failed");
    });

    let (client_read, client_write) = tokio::io::split(client);
    let facade = Arc::new(RemoteCapsule::new(PipeTransport::new(
        client_read,
        client_write,
    )));

    RemotePair {
        facade,
        capsule,
        runner_task,
    }
}

/// A calculator capsule: one call operation `math.add`.
#[allow(dead_code)]
pub fn calculator() -> CapsuleDefinition {
    CapsuleDefinition::new("calculator").capability(Capability::new("math").operation(
        Operation::call("add", |ctx| async move {
            let a = ctx.params["a"].as_i64().unwrap_or(0);
            let b = ctx.params["b"].as_i64().unwrap_or(0);
            Ok(json!(a.saturating_add(b)))
        }),
    ))
}
