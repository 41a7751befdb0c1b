//! The live dispatch engine.

use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use tracing::{debug, trace};

use capsa_core::{
    CancelRegistration, CancelToken, CapsuleState, EngineError, EngineResult, RequestId,
};
use capsa_events::{Stimulus, StimulusBus, StimulusSource, Subscription};

use crate::definition::{CapsuleDefinition, Handler, HookContext, HookFn, OperationContext};
use crate::describe::CapsuleDescription;
use crate::middleware::{InvocationContext, Middleware, MiddlewareDecision};
use crate::registry::CapabilityRegistry;

/// A stream of operation results.
pub type ValueStream = BoxStream<'static, EngineResult<Value>>;

/// What a trigger produced.
pub enum TriggerReply {
    /// Single result of a `call` operation.
    Value(Value),
    /// Lazy sequence produced by a `stream` operation. Returned
    /// unawaited; consuming it drives the handler.
    Stream(ValueStream),
}

impl TriggerReply {
    /// The single result, if this was a `call`.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Stream(_) => None,
        }
    }

    /// The result stream, if this was a `stream`.
    pub fn into_stream(self) -> Option<ValueStream> {
        match self {
            Self::Value(_) => None,
            Self::Stream(stream) => Some(stream),
        }
    }
}

impl std::fmt::Debug for TriggerReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

struct CapsuleInner {
    state: Mutex<CapsuleState>,
    /// Serializes boot/shutdown so hooks never race each other.
    lifecycle: tokio::sync::Mutex<()>,
    registry: CapabilityRegistry,
    middleware: Vec<Arc<dyn Middleware>>,
    on_boot: Option<HookFn>,
    on_shutdown: Option<HookFn>,
    bus: StimulusBus,
    inflight: DashMap<RequestId, CancelToken>,
    shutdown_token: CancelToken,
    description: CapsuleDescription,
}

impl CapsuleInner {
    fn state(&self) -> CapsuleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CapsuleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Emits stimuli on behalf of one source.
///
/// Handlers get an emitter bound to their capability and operation;
/// lifecycle hooks get a privileged, sourceless emitter that may emit
/// exactly during the transition the hook runs in.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<CapsuleInner>,
    source: Option<StimulusSource>,
    privileged: bool,
}

impl Emitter {
    /// Emit a stimulus with this emitter's source binding.
    pub fn emit(&self, sense: impl Into<String>, data: Value) {
        self.emit_stimulus(Stimulus::new(sense, data));
    }

    /// Emit a pre-built stimulus. The emitter's source binding
    /// overrides whatever the stimulus carried; a missing timestamp is
    /// stamped.
    pub fn emit_stimulus(&self, mut stimulus: Stimulus) {
        if self.source.is_some() {
            stimulus.source.clone_from(&self.source);
        }
        if !self.privileged && self.inner.state() != CapsuleState::Booted {
            trace!(sense = %stimulus.sense, "Stimulus dropped, capsule not booted");
            return;
        }
        stimulus.stamp();
        self.inner.bus.emit(&stimulus);
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("source", &self.source)
            .field("privileged", &self.privileged)
            .finish()
    }
}

/// Removes one in-flight entry on drop so every trigger exit path
/// cleans up exactly once. Also takes the per-request token's links
/// off the caller and shutdown tokens, which outlive the request.
struct InflightGuard {
    inner: Weak<CapsuleInner>,
    id: RequestId,
    links: Vec<CancelRegistration>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        for link in self.links.drain(..) {
            link.unregister();
        }
        if let Some(inner) = self.inner.upgrade() {
            if inner.inflight.remove(&self.id).is_some() {
                trace!(id = %self.id, "In-flight entry removed");
            }
        }
    }
}

/// Keeps the in-flight entry alive for as long as the caller holds the
/// stream.
struct GuardedStream {
    inner: ValueStream,
    _guard: InflightGuard,
}

impl Stream for GuardedStream {
    type Item = EngineResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

/// One bounded execution context exposing capabilities.
///
/// Clones share the same live instance. The lifecycle is one-way:
/// created -> booted -> shutdown, never resurrected.
#[derive(Clone)]
pub struct Capsule {
    inner: Arc<CapsuleInner>,
}

impl Capsule {
    /// Construct a capsule from its definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidDefinition`] on duplicate
    /// capability or operation names.
    pub fn new(definition: CapsuleDefinition) -> EngineResult<Self> {
        let CapsuleDefinition {
            name,
            docs,
            middleware,
            capabilities,
            on_boot,
            on_shutdown,
        } = definition;

        let registry = CapabilityRegistry::new(capabilities)?;
        let description = CapsuleDescription {
            name,
            docs,
            capabilities: registry.descriptions().to_vec(),
        };

        Ok(Self {
            inner: Arc::new(CapsuleInner {
                state: Mutex::new(CapsuleState::Created),
                lifecycle: tokio::sync::Mutex::new(()),
                registry,
                middleware,
                on_boot,
                on_shutdown,
                bus: StimulusBus::new(),
                inflight: DashMap::new(),
                shutdown_token: CancelToken::new(),
                description,
            }),
        })
    }

    /// Capsule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.description.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CapsuleState {
        self.inner.state()
    }

    /// Static metadata. Valid before boot and stable across the whole
    /// lifecycle.
    #[must_use]
    pub fn describe(&self) -> CapsuleDescription {
        self.inner.description.clone()
    }

    /// Number of operations currently in flight.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Boot the capsule.
    ///
    /// Idempotent once booted. Runs the boot hook (if any) with a
    /// privileged emitter; on hook failure the capsule stays created
    /// and boot may be retried.
    ///
    /// # Errors
    ///
    /// [`EngineError::Lifecycle`] if already shut down, or the boot
    /// hook's failure as [`EngineError::Handler`].
    pub async fn boot(&self) -> EngineResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.inner.state() {
            CapsuleState::Booted => return Ok(()),
            CapsuleState::Shutdown => {
                return Err(EngineError::lifecycle(CapsuleState::Shutdown, "boot"));
            },
            CapsuleState::Created => {},
        }

        if let Some(hook) = &self.inner.on_boot {
            let ctx = HookContext {
                emitter: self.privileged_emitter(),
            };
            hook(ctx).await.map_err(EngineError::Handler)?;
        }

        self.inner.set_state(CapsuleState::Booted);
        debug!(capsule = %self.name(), "Capsule booted");
        Ok(())
    }

    /// Shut the capsule down.
    ///
    /// Idempotent once shut down. Cancels every in-flight token with
    /// reason `"system"`, runs the shutdown hook, and transitions to
    /// shutdown regardless of whether the hook fails. Does not wait
    /// for handlers to observe cancellation.
    ///
    /// # Errors
    ///
    /// [`EngineError::Lifecycle`] if never booted, or the shutdown
    /// hook's failure as [`EngineError::Handler`] (after the state
    /// transition).
    pub async fn shutdown(&self) -> EngineResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        match self.inner.state() {
            CapsuleState::Shutdown => return Ok(()),
            CapsuleState::Created => {
                return Err(EngineError::lifecycle(CapsuleState::Created, "shutdown"));
            },
            CapsuleState::Booted => {},
        }

        self.inner.shutdown_token.cancel("system");
        for entry in &self.inner.inflight {
            entry.value().cancel("system");
        }

        let hook_result = match &self.inner.on_shutdown {
            Some(hook) => {
                let ctx = HookContext {
                    emitter: self.privileged_emitter(),
                };
                hook(ctx).await
            },
            None => Ok(()),
        };

        self.inner.set_state(CapsuleState::Shutdown);
        debug!(capsule = %self.name(), "Capsule shut down");
        hook_result.map_err(EngineError::Handler)
    }

    /// Invoke an operation by capability and operation name.
    ///
    /// Runs capsule-level middleware, then operation-level middleware,
    /// strictly in list order, then the handler. A `stream` operation
    /// returns its lazy sequence unawaited; a `call` operation is
    /// awaited to a single value.
    ///
    /// # Errors
    ///
    /// [`EngineError::Lifecycle`] unless booted,
    /// [`EngineError::UnknownCapability`]/[`EngineError::UnknownOperation`]
    /// for absent names, [`EngineError::Aborted`] if the caller's token
    /// is already cancelled, [`EngineError::Rejected`] on middleware
    /// rejection, and [`EngineError::Middleware`]/[`EngineError::Handler`]
    /// for failures in either.
    pub async fn trigger(
        &self,
        capability: &str,
        operation: &str,
        params: Value,
        token: Option<CancelToken>,
    ) -> EngineResult<TriggerReply> {
        let state = self.inner.state();
        if state != CapsuleState::Booted {
            return Err(EngineError::lifecycle(state, "trigger"));
        }

        let op = self.inner.registry.operation(capability, operation)?;

        // A pre-cancelled caller token fails the call before any
        // middleware runs.
        if let Some(caller_token) = &token {
            if let Some(reason) = caller_token.reason() {
                return Err(EngineError::Aborted { reason });
            }
        }

        let op_token = CancelToken::new();
        let mut links = Vec::with_capacity(2);
        if let Some(caller_token) = &token {
            links.push(op_token.link(caller_token));
        }
        links.push(op_token.link(&self.inner.shutdown_token));

        let request_id = RequestId::new();
        self.inner.inflight.insert(request_id, op_token.clone());
        let guard = InflightGuard {
            inner: Arc::downgrade(&self.inner),
            id: request_id,
            links,
        };

        trace!(id = %request_id, capability, operation, "Trigger accepted");

        let mut params = params;
        for middleware in self.inner.middleware.iter().chain(op.middleware.iter()) {
            let ctx = InvocationContext {
                capability,
                operation,
                params: &params,
                token: &op_token,
            };
            match middleware.intercept(ctx).await {
                Ok(MiddlewareDecision::Accept) => {},
                Ok(MiddlewareDecision::Transform(new_params)) => params = new_params,
                Ok(MiddlewareDecision::Reject(reason)) => {
                    debug!(id = %request_id, reason = %reason, "Trigger rejected by middleware");
                    return Err(EngineError::Rejected { reason });
                },
                Err(error) => return Err(EngineError::Middleware(error)),
            }
        }

        let ctx = OperationContext {
            params,
            token: op_token,
            emitter: self.operation_emitter(capability, operation),
        };

        match &op.handler {
            Handler::Call(handler) => {
                let result = handler(ctx).await;
                drop(guard);
                result.map(TriggerReply::Value).map_err(EngineError::Handler)
            },
            Handler::Stream(handler) => {
                let stream = handler(ctx).map(|item| item.map_err(EngineError::Handler));
                Ok(TriggerReply::Stream(Box::pin(GuardedStream {
                    inner: stream.boxed(),
                    _guard: guard,
                })))
            },
        }
    }

    /// Emit a stimulus. Delivered to listeners in registration order
    /// when booted; silently dropped otherwise.
    pub fn emit(&self, stimulus: Stimulus) {
        Emitter {
            inner: Arc::clone(&self.inner),
            source: None,
            privileged: false,
        }
        .emit_stimulus(stimulus);
    }

    /// Register a stimulus listener. The returned subscription removes
    /// exactly this registration.
    pub fn on_stimulus(&self, listener: impl Fn(&Stimulus) + Send + Sync + 'static) -> Subscription {
        self.inner.bus.subscribe(listener)
    }

    /// The bus this capsule delivers stimuli on.
    #[must_use]
    pub fn stimulus_bus(&self) -> &StimulusBus {
        &self.inner.bus
    }

    fn operation_emitter(&self, capability: &str, operation: &str) -> Emitter {
        Emitter {
            inner: Arc::clone(&self.inner),
            source: Some(StimulusSource {
                capability: capability.to_string(),
                operation: operation.to_string(),
            }),
            privileged: false,
        }
    }

    fn privileged_emitter(&self) -> Emitter {
        Emitter {
            inner: Arc::clone(&self.inner),
            source: None,
            privileged: true,
        }
    }
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capsule")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("inflight", &self.inflight_count())
            .finish()
    }
}
