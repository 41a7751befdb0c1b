//! Client side of the line protocol.
//!
//! A [`RemoteCapsule`] presents the same boot/trigger/shutdown
//! contract a local capsule offers, backed by a transport to a
//! protocol runner. Requests are correlated by id: call triggers park
//! a oneshot in a pending map, stream triggers register a stream
//! bridge, and a reader task routes every inbound line to its waiter.
//!
//! Correlation layout grounded on the plugin-host pattern of a shared
//! pending map drained by a dedicated reader task.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use capsa_core::{CancelRegistration, CancelToken, CapsuleState, EngineError, RequestId};
use capsa_engine::{CapsuleDescription, OperationKind};
use capsa_events::{Stimulus, StimulusBus, Subscription};
use capsa_wire::{decode_message, encode_line, ClientMessage, LineDecoder, ServerMessage};

use crate::bridge::{BridgeStream, StreamBridge};
use crate::error::{RemoteError, RemoteResult};
use crate::transport::Transport;

const READ_CHUNK: usize = 8192;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a remote trigger.
pub enum RemoteReply {
    /// Single result of a call operation.
    Value(Value),
    /// Lazily consumed sequence from a stream operation.
    Stream(BridgeStream),
}

impl RemoteReply {
    /// The single value, if this was a call operation.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Stream(_) => None,
        }
    }

    /// The stream, if this was a stream operation.
    #[must_use]
    pub fn into_stream(self) -> Option<BridgeStream> {
        match self {
            Self::Value(_) => None,
            Self::Stream(stream) => Some(stream),
        }
    }
}

impl std::fmt::Debug for RemoteReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Producer half of one in-flight stream trigger, plus the abort
/// listener parked on the caller's token for its duration.
struct StreamSlot {
    bridge: StreamBridge,
    abort_link: Option<CancelRegistration>,
}

impl StreamSlot {
    /// Terminate the bridged sequence and release the token listener.
    fn settle(self, error: Option<String>) {
        if let Some(link) = self.abort_link {
            link.unregister();
        }
        match error {
            Some(message) => self.bridge.fail(message),
            None => self.bridge.end(),
        }
    }
}

struct FacadeInner {
    transport: Box<dyn Transport>,
    capsule_name: Option<String>,
    state: Mutex<CapsuleState>,
    // Serializes boot/shutdown transitions.
    lifecycle: tokio::sync::Mutex<()>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    pending: DashMap<RequestId, oneshot::Sender<RemoteResult<Value>>>,
    streams: DashMap<RequestId, StreamSlot>,
    boot_waiter: Mutex<Option<oneshot::Sender<ServerMessage>>>,
    shutdown_waiter: Mutex<Option<oneshot::Sender<ServerMessage>>>,
    metadata: Mutex<Option<CapsuleDescription>>,
    bus: StimulusBus,
    poisoned: AtomicBool,
}

/// A capsule living on the other side of a transport.
pub struct RemoteCapsule {
    inner: Arc<FacadeInner>,
}

impl RemoteCapsule {
    /// Facade over `transport`, booting whichever capsule the remote
    /// runner hosts.
    #[must_use]
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::build(transport, None)
    }

    /// Facade over `transport`, requiring the remote capsule to carry
    /// `name`.
    #[must_use]
    pub fn named(transport: impl Transport + 'static, name: impl Into<String>) -> Self {
        Self::build(transport, Some(name.into()))
    }

    fn build(transport: impl Transport + 'static, capsule_name: Option<String>) -> Self {
        Self {
            inner: Arc::new(FacadeInner {
                transport: Box::new(transport),
                capsule_name,
                state: Mutex::new(CapsuleState::Created),
                lifecycle: tokio::sync::Mutex::new(()),
                out_tx: Mutex::new(None),
                pending: DashMap::new(),
                streams: DashMap::new(),
                boot_waiter: Mutex::new(None),
                shutdown_waiter: Mutex::new(None),
                metadata: Mutex::new(None),
                bus: StimulusBus::new(),
                poisoned: AtomicBool::new(false),
            }),
        }
    }

    /// Current local lifecycle state.
    #[must_use]
    pub fn state(&self) -> CapsuleState {
        self.inner.state()
    }

    /// Remote capsule metadata, known after a successful boot.
    #[must_use]
    pub fn describe(&self) -> Option<CapsuleDescription> {
        self.inner
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a listener for stimuli forwarded from the remote
    /// capsule (and for local [`RemoteCapsule::emit`] calls).
    pub fn on_stimulus(&self, listener: impl Fn(&Stimulus) + Send + Sync + 'static) -> Subscription {
        self.inner.bus.subscribe(listener)
    }

    /// Deliver a stimulus to local listeners. Remote listeners never
    /// see it; the wire only carries stimuli from the capsule side
    /// outward. Dropped unless booted.
    pub fn emit(&self, mut stimulus: Stimulus) {
        if self.inner.state() != CapsuleState::Booted {
            debug!(sense = %stimulus.sense, "Dropping stimulus: facade not booted");
            return;
        }
        stimulus.stamp();
        self.inner.bus.emit(&stimulus);
    }

    /// Connect the transport and boot the remote capsule.
    ///
    /// Idempotent once booted. A `ready: false` answer raises and
    /// leaves the facade created.
    ///
    /// # Errors
    ///
    /// [`EngineError::Lifecycle`] if already shut down,
    /// [`RemoteError::Remote`] if the remote refused to boot, and
    /// transport errors if the connection failed.
    pub async fn boot(&self) -> RemoteResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        match self.inner.state() {
            CapsuleState::Booted => return Ok(()),
            CapsuleState::Shutdown => {
                return Err(EngineError::lifecycle(CapsuleState::Shutdown, "boot").into());
            },
            CapsuleState::Created => {},
        }
        if self.inner.poisoned.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("transport previously failed"));
        }

        let io = self.inner.transport.connect().await?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(io.writer, out_rx));
        tokio::spawn(read_loop(Arc::clone(&self.inner), io.reader));

        let (boot_tx, boot_rx) = oneshot::channel();
        *self
            .inner
            .boot_waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(boot_tx);

        out_tx
            .send(ClientMessage::Boot {
                capsule_name: self.inner.capsule_name.clone(),
            })
            .map_err(|_| RemoteError::transport("connection closed before boot"))?;
        *self
            .inner
            .out_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(out_tx);

        match boot_rx.await {
            Ok(ServerMessage::BootResponse {
                ready: true,
                metadata,
                ..
            }) => {
                *self
                    .inner
                    .metadata
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = metadata;
                self.inner.set_state(CapsuleState::Booted);
                info!("Remote capsule booted");
                Ok(())
            },
            Ok(ServerMessage::BootResponse { error, .. }) => {
                self.inner.close_connection().await;
                Err(RemoteError::Remote {
                    message: error.unwrap_or_else(|| "remote capsule refused to boot".into()),
                })
            },
            Ok(other) => {
                self.inner.close_connection().await;
                Err(RemoteError::Protocol {
                    message: format!("unexpected boot answer: {other:?}"),
                })
            },
            Err(_) => {
                self.inner.close_connection().await;
                Err(RemoteError::transport("connection lost during boot"))
            },
        }
    }

    /// Invoke a remote operation.
    ///
    /// Stream operations return the bridge stream immediately; call
    /// operations await the correlated response. A caller token
    /// cancellation is relayed as a best-effort `abort` message.
    ///
    /// # Errors
    ///
    /// Local contract violations (wrong state, unknown names,
    /// pre-cancelled token) raise the same [`EngineError`] values a
    /// local capsule would; remote failures arrive as
    /// [`RemoteError::Remote`]; a broken transport as
    /// [`RemoteError::Transport`].
    pub async fn trigger(
        &self,
        capability: &str,
        operation: &str,
        params: Value,
        token: Option<CancelToken>,
    ) -> RemoteResult<RemoteReply> {
        let state = self.inner.state();
        if state != CapsuleState::Booted {
            return Err(EngineError::lifecycle(state, "trigger").into());
        }
        if self.inner.poisoned.load(Ordering::SeqCst) {
            return Err(RemoteError::transport("transport failed; facade unusable"));
        }

        let kind = self.operation_kind(capability, operation)?;

        if let Some(caller_token) = &token {
            if let Some(reason) = caller_token.reason() {
                return Err(EngineError::Aborted { reason }.into());
            }
        }

        let out_tx = self
            .inner
            .out_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RemoteError::transport("not connected"))?;

        // The caller's token relays cancellation as a best-effort
        // abort; the registration is released when the request
        // settles so a reused token does not collect dead listeners.
        let id = RequestId::new();
        let mut abort_link = token.as_ref().map(|caller_token| {
            let abort_tx = out_tx.clone();
            caller_token.on_cancel(move |reason| {
                let _ = abort_tx.send(ClientMessage::Abort {
                    id,
                    reason: reason.to_owned(),
                });
            })
        });

        // Waiters are registered before the trigger is written so no
        // inbound line can race past an absent entry.
        let (call_rx, stream) = match kind {
            OperationKind::Call => {
                let (tx, rx) = oneshot::channel();
                self.inner.pending.insert(id, tx);
                (Some(rx), None)
            },
            OperationKind::Stream => {
                let (bridge, stream) = StreamBridge::channel();
                self.inner.streams.insert(
                    id,
                    StreamSlot {
                        bridge,
                        abort_link: abort_link.take(),
                    },
                );
                (None, Some(stream))
            },
        };

        let message = ClientMessage::Trigger {
            id,
            capability: capability.to_owned(),
            operation: operation.to_owned(),
            params,
            signal_aborted: token.as_ref().is_some_and(CancelToken::is_cancelled),
        };
        if out_tx.send(message).is_err() {
            self.inner.pending.remove(&id);
            if let Some((_, slot)) = self.inner.streams.remove(&id) {
                slot.settle(Some("connection closed".into()));
            }
            if let Some(link) = abort_link {
                link.unregister();
            }
            return Err(RemoteError::transport("connection closed"));
        }

        // The reader may have poisoned and drained the maps between
        // the flag check above and this registration; settle the
        // entry ourselves in that case.
        if self.inner.poisoned.load(Ordering::SeqCst) {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Err(RemoteError::transport("connection lost")));
            }
            if let Some((_, slot)) = self.inner.streams.remove(&id) {
                slot.settle(Some("connection lost".into()));
            }
        }

        match (call_rx, stream) {
            (Some(rx), _) => {
                let outcome = match rx.await {
                    Ok(result) => result.map(RemoteReply::Value),
                    Err(_) => Err(RemoteError::transport("connection lost before response")),
                };
                if let Some(link) = abort_link {
                    link.unregister();
                }
                outcome
            },
            (None, Some(stream)) => Ok(RemoteReply::Stream(stream)),
            (None, None) => unreachable!("trigger resolved to neither call nor stream"),
        }
    }

    /// Shut the remote capsule down and release the transport.
    ///
    /// Idempotent once shut down. The response wait is bounded; the
    /// transport is terminated and the local state becomes shutdown
    /// regardless of the remote's answer.
    ///
    /// # Errors
    ///
    /// [`EngineError::Lifecycle`] if never booted,
    /// [`RemoteError::Timeout`] if the remote never answered, and
    /// [`RemoteError::Remote`] if the remote reported a shutdown
    /// failure.
    pub async fn shutdown(&self) -> RemoteResult<()> {
        let _guard = self.inner.lifecycle.lock().await;
        match self.inner.state() {
            CapsuleState::Shutdown => return Ok(()),
            CapsuleState::Created => {
                return Err(EngineError::lifecycle(CapsuleState::Created, "shutdown").into());
            },
            CapsuleState::Booted => {},
        }

        let out_tx = self
            .inner
            .out_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut outcome = Ok(());
        if let Some(out_tx) = out_tx {
            let (tx, rx) = oneshot::channel();
            *self
                .inner
                .shutdown_waiter
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(tx);

            if out_tx.send(ClientMessage::Shutdown).is_ok() {
                outcome = match tokio::time::timeout(SHUTDOWN_TIMEOUT, rx).await {
                    Ok(Ok(ServerMessage::ShutdownResponse { ok: true, .. })) => Ok(()),
                    Ok(Ok(ServerMessage::ShutdownResponse { error, .. })) => {
                        Err(RemoteError::Remote {
                            message: error
                                .unwrap_or_else(|| "remote shutdown failed".into()),
                        })
                    },
                    Ok(Ok(other)) => Err(RemoteError::Protocol {
                        message: format!("unexpected shutdown answer: {other:?}"),
                    }),
                    Ok(Err(_)) => {
                        Err(RemoteError::transport("connection lost during shutdown"))
                    },
                    Err(_) => Err(RemoteError::Timeout {
                        what: "shutdown response".into(),
                    }),
                };
            }
        }

        self.inner.close_connection().await;
        self.inner.set_state(CapsuleState::Shutdown);
        info!("Remote capsule shut down");
        outcome
    }

    fn operation_kind(&self, capability: &str, operation: &str) -> RemoteResult<OperationKind> {
        let metadata = self
            .inner
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| RemoteError::Protocol {
                message: "booted without capsule metadata".into(),
            })?;
        match metadata.operation_kind(capability, operation) {
            Some(kind) => Ok(kind),
            None if metadata.has_capability(capability) => Err(EngineError::UnknownOperation {
                capability: capability.to_owned(),
                operation: operation.to_owned(),
            }
            .into()),
            None => Err(EngineError::UnknownCapability {
                capability: capability.to_owned(),
            }
            .into()),
        }
    }
}

impl std::fmt::Debug for RemoteCapsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCapsule")
            .field("state", &self.inner.state())
            .field("pending", &self.inner.pending.len())
            .field("streams", &self.inner.streams.len())
            .finish()
    }
}

impl FacadeInner {
    fn state(&self) -> CapsuleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CapsuleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Drop the outbound sender and terminate the transport.
    async fn close_connection(&self) {
        drop(
            self.out_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Err(error) = self.transport.terminate().await {
            warn!(%error, "Transport teardown failed");
        }
    }

    /// Route one inbound message to its waiter.
    fn route(&self, message: ServerMessage) {
        match message {
            answer @ ServerMessage::BootResponse { .. } => {
                let waiter = self
                    .boot_waiter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(answer);
                    },
                    None => debug!("Dropping unsolicited boot response"),
                }
            },
            answer @ ServerMessage::ShutdownResponse { .. } => {
                let waiter = self
                    .shutdown_waiter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(answer);
                    },
                    None => debug!("Dropping unsolicited shutdown response"),
                }
            },
            ServerMessage::Response { id, result, error } => match self.pending.remove(&id) {
                Some((_, tx)) => {
                    let outcome = match error {
                        Some(message) => Err(RemoteError::Remote { message }),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                },
                None => debug!(%id, "Dropping response with no pending request"),
            },
            ServerMessage::StreamData { id, data } => match self.streams.get(&id) {
                Some(slot) => {
                    slot.bridge.push(data);
                },
                None => debug!(%id, "Dropping stream item with no bridge"),
            },
            ServerMessage::StreamEnd { id, error } => match self.streams.remove(&id) {
                Some((_, slot)) => slot.settle(error),
                None => debug!(%id, "Dropping stream end with no bridge"),
            },
            ServerMessage::Stimulus {
                sense,
                data,
                source,
                timestamp,
            } => {
                let stimulus = Stimulus {
                    sense,
                    data,
                    source,
                    timestamp: Some(timestamp),
                };
                self.bus.emit(&stimulus);
            },
        }
    }

    /// Transport gone: reject every waiter and mark the facade
    /// permanently unusable.
    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        drop(
            self.out_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        drop(
            self.boot_waiter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        drop(
            self.shutdown_waiter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let pending: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in pending {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(RemoteError::transport("connection lost")));
            }
        }
        let streams: Vec<RequestId> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in streams {
            if let Some((_, slot)) = self.streams.remove(&id) {
                slot.settle(Some("connection lost".into()));
            }
        }
    }
}

async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = out_rx.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "Failed to encode outbound message");
                continue;
            },
        };
        if let Err(error) = writer.write_all(line.as_bytes()).await {
            warn!(%error, "Write to runner failed");
            break;
        }
        if let Err(error) = writer.flush().await {
            warn!(%error, "Flush to runner failed");
            break;
        }
    }
}

async fn read_loop(inner: Arc<FacadeInner>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut decoder = LineDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Runner closed the connection");
                break;
            },
            Ok(n) => {
                for value in decoder.push(&chunk[..n]) {
                    match decode_message::<ServerMessage>(value) {
                        Ok(message) => inner.route(message),
                        Err(error) => warn!(%error, "Dropping malformed server message"),
                    }
                }
            },
            Err(error) => {
                warn!(%error, "Transport read failed");
                break;
            },
        }
    }
    inner.poison();
}
