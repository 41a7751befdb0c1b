//! Server side of the line protocol.
//!
//! A [`ProtocolRunner`] hosts one dispatch engine and drives it from
//! inbound client messages, turning replies, stream items, and
//! stimuli back into outbound lines. One runner serves one
//! connection; the serve loop ends when the client sends `shutdown`
//! or the byte stream closes.

use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use capsa_core::{CancelToken, CapsuleState, EngineResult, RequestId};
use capsa_engine::{Capsule, CapsuleDefinition, TriggerReply, ValueStream};
use capsa_wire::{decode_message, encode_line, ClientMessage, LineDecoder, ServerMessage};

use crate::error::RemoteResult;

const READ_CHUNK: usize = 8192;

/// Hosts one capsule behind the line protocol.
pub struct ProtocolRunner {
    capsule: Arc<Capsule>,
    aborts: Arc<DashMap<RequestId, CancelToken>>,
    booted: AtomicBool,
}

impl ProtocolRunner {
    /// Build a runner around a capsule definition. The capsule starts
    /// in the created state; the client's `boot` message boots it.
    ///
    /// # Errors
    ///
    /// Returns [`capsa_core::EngineError::InvalidDefinition`] if the
    /// definition is malformed.
    pub fn new(definition: CapsuleDefinition) -> EngineResult<Self> {
        Ok(Self {
            capsule: Arc::new(Capsule::new(definition)?),
            aborts: Arc::new(DashMap::new()),
            booted: AtomicBool::new(false),
        })
    }

    /// The hosted capsule.
    #[must_use]
    pub fn capsule(&self) -> &Arc<Capsule> {
        &self.capsule
    }

    /// Serve one connection until the client shuts down or the byte
    /// stream closes.
    ///
    /// On a plain stream close without a `shutdown` message the
    /// capsule is shut down best-effort before returning.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading from the connection fails.
    pub async fn serve<R, W>(&self, mut reader: R, writer: W) -> RemoteResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let writer_task = tokio::spawn(write_loop(writer, out_rx));

        // Every stimulus the capsule emits is forwarded to the client.
        let stimulus_tx = out_tx.clone();
        let subscription = self.capsule.on_stimulus(move |stimulus| {
            let _ = stimulus_tx.send(ServerMessage::from_stimulus(stimulus));
        });

        let mut decoder = LineDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut clean_shutdown = false;

        'read: loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                debug!("Connection closed by peer");
                break;
            }
            for value in decoder.push(&chunk[..n]) {
                let message = match decode_message::<ClientMessage>(value.clone()) {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(%error, "Dropping malformed client message");
                        // A malformed trigger with a readable id still
                        // gets an error response.
                        if let Some(id) = recover_id(&value) {
                            let _ = out_tx.send(ServerMessage::Response {
                                id,
                                result: None,
                                error: Some(format!("malformed message: {error}")),
                            });
                        }
                        continue;
                    },
                };
                if self.handle(message, &out_tx).await {
                    clean_shutdown = true;
                    break 'read;
                }
            }
        }

        subscription.unsubscribe();
        drop(out_tx);

        if clean_shutdown {
            // The writer exits on its own after flushing the
            // shutdown response.
            let _ = writer_task.await;
        } else {
            // A handler that never observes cancellation could hold
            // an outbound sender forever; the transport is gone, so
            // pending output is moot.
            writer_task.abort();
            if self.capsule.state() == CapsuleState::Booted {
                if let Err(error) = self.capsule.shutdown().await {
                    warn!(%error, "Shutdown after connection loss failed");
                }
            }
        }
        Ok(())
    }

    /// Handle one message. Returns `true` when the serve loop should
    /// exit.
    async fn handle(
        &self,
        message: ClientMessage,
        out_tx: &mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        match message {
            ClientMessage::Boot { capsule_name } => {
                let _ = out_tx.send(self.boot(capsule_name.as_deref()).await);
                false
            },
            ClientMessage::Trigger {
                id,
                capability,
                operation,
                params,
                signal_aborted,
            } => {
                if signal_aborted {
                    // The caller's token was already cancelled when
                    // the message was sent; never reaches the engine.
                    let _ = out_tx.send(ServerMessage::Response {
                        id,
                        result: None,
                        error: Some("operation aborted: aborted before dispatch".into()),
                    });
                    return false;
                }
                let token = CancelToken::new();
                self.aborts.insert(id, token.clone());
                tokio::spawn(dispatch(
                    Arc::clone(&self.capsule),
                    Arc::clone(&self.aborts),
                    id,
                    capability,
                    operation,
                    params,
                    token,
                    out_tx.clone(),
                ));
                false
            },
            ClientMessage::Abort { id, reason } => {
                match self.aborts.get(&id) {
                    Some(token) => {
                        debug!(%id, reason, "Aborting in-flight trigger");
                        token.cancel(reason);
                    },
                    None => debug!(%id, "Abort for unknown or settled trigger ignored"),
                }
                false
            },
            ClientMessage::Shutdown => {
                info!(capsule = %self.capsule.name(), "Shutting down on client request");
                let result = self.capsule.shutdown().await;
                let _ = out_tx.send(ServerMessage::ShutdownResponse {
                    ok: result.is_ok(),
                    error: result.err().map(|error| error.to_string()),
                });
                true
            },
        }
    }

    async fn boot(&self, capsule_name: Option<&str>) -> ServerMessage {
        if let Some(name) = capsule_name {
            if name != self.capsule.name() {
                return ServerMessage::BootResponse {
                    ready: false,
                    metadata: None,
                    error: Some(format!("unknown capsule: {name}")),
                };
            }
        }
        if self.booted.swap(true, Ordering::SeqCst) {
            return ServerMessage::BootResponse {
                ready: false,
                metadata: None,
                error: Some("capsule already booted".into()),
            };
        }
        match self.capsule.boot().await {
            Ok(()) => {
                info!(capsule = %self.capsule.name(), "Capsule booted for connection");
                ServerMessage::BootResponse {
                    ready: true,
                    metadata: Some(self.capsule.describe()),
                    error: None,
                }
            },
            Err(error) => {
                // Boot hook failure leaves the capsule created and
                // retryable.
                self.booted.store(false, Ordering::SeqCst);
                ServerMessage::BootResponse {
                    ready: false,
                    metadata: None,
                    error: Some(error.to_string()),
                }
            },
        }
    }
}

impl std::fmt::Debug for ProtocolRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRunner")
            .field("capsule", &self.capsule.name())
            .field("inflight", &self.aborts.len())
            .finish()
    }
}

/// Run one trigger to completion, streaming its output to the
/// outbound channel. Removes the wire id from the abort map on every
/// exit path.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    capsule: Arc<Capsule>,
    aborts: Arc<DashMap<RequestId, CancelToken>>,
    id: RequestId,
    capability: String,
    operation: String,
    params: serde_json::Value,
    token: CancelToken,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let reply = capsule
        .trigger(&capability, &operation, params, Some(token.clone()))
        .await;

    match reply {
        Ok(TriggerReply::Value(result)) => {
            send(&out_tx, id, ServerMessage::Response {
                id,
                result: Some(result),
                error: None,
            });
        },
        Ok(TriggerReply::Stream(stream)) => forward_stream(id, stream, &token, &out_tx).await,
        Err(error) => {
            // A failure while the token is cancelled is reported as
            // abort-caused, whatever the handler actually returned.
            let text = match token.reason() {
                Some(reason) if !error.is_abort() => {
                    format!("operation aborted: {reason} ({error})")
                },
                _ => error.to_string(),
            };
            send(&out_tx, id, ServerMessage::Response {
                id,
                result: None,
                error: Some(text),
            });
        },
    }

    aborts.remove(&id);
}

/// Pump a stream's items onto the wire until it ends or the trigger's
/// token cancels. The cancellation arm wins ties so an always-ready
/// stream cannot keep emitting past an abort.
async fn forward_stream(
    id: RequestId,
    mut stream: ValueStream,
    token: &CancelToken,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    loop {
        tokio::select! {
            biased;
            reason = token.cancelled() => {
                send(out_tx, id, ServerMessage::StreamEnd {
                    id,
                    error: Some(format!("operation aborted: {reason}")),
                });
                break;
            },
            item = stream.next() => match item {
                Some(Ok(data)) => send(out_tx, id, ServerMessage::StreamData { id, data }),
                Some(Err(error)) => {
                    send(out_tx, id, ServerMessage::StreamEnd {
                        id,
                        error: Some(error.to_string()),
                    });
                    break;
                },
                None => {
                    send(out_tx, id, ServerMessage::StreamEnd { id, error: None });
                    break;
                },
            },
        }
    }
}

fn send(out_tx: &mpsc::UnboundedSender<ServerMessage>, id: RequestId, message: ServerMessage) {
    if out_tx.send(message).is_err() {
        debug!(%id, "Discarding output for a closed connection");
    }
}

/// Drains outbound messages onto the wire. Exits after writing the
/// shutdown response, which is the runner's last output.
async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::UnboundedReceiver<ServerMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = out_rx.recv().await {
        let last = matches!(message, ServerMessage::ShutdownResponse { .. });
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "Failed to encode outbound message");
                continue;
            },
        };
        if let Err(error) = writer.write_all(line.as_bytes()).await {
            warn!(%error, "Write to client failed; closing outbound side");
            break;
        }
        if let Err(error) = writer.flush().await {
            warn!(%error, "Flush to client failed; closing outbound side");
            break;
        }
        if last {
            break;
        }
    }
    out_rx.close();
}

fn recover_id(value: &serde_json::Value) -> Option<RequestId> {
    serde_json::from_value(value.get("id")?.clone()).ok()
}
