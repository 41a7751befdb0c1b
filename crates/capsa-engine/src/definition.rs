//! Capsule definitions: capabilities, operations, handlers and hooks.
//!
//! A [`CapsuleDefinition`] is the immutable blueprint handed to
//! [`crate::Capsule::new`]. Once passed to the engine it cannot
//! change; the live capsule owns a read-only registry built from it.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use capsa_core::CancelToken;

use crate::capsule::Emitter;
use crate::middleware::Middleware;

/// Whether an operation produces one result or a stream of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Returns a single result value (or fails).
    Call,
    /// Produces a lazy, non-restartable sequence of values (or fails
    /// mid-sequence).
    Stream,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// Everything a handler gets for one invocation.
pub struct OperationContext {
    /// Invocation params, as transformed by the middleware chain.
    pub params: Value,
    /// Cancellation token for this invocation. Cooperative: a handler
    /// that never checks it runs to completion.
    pub token: CancelToken,
    /// Emits stimuli attributed to this operation.
    pub emitter: Emitter,
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("params", &self.params)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Context handed to boot/shutdown hooks.
///
/// The emitter is privileged: it may emit exactly during the lifecycle
/// transition the hook runs in, and is bound to no source.
pub struct HookContext {
    /// Sourceless, privileged emitter.
    pub emitter: Emitter,
}

pub(crate) type CallHandlerFn =
    Arc<dyn Fn(OperationContext) -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send + Sync>;
pub(crate) type StreamHandlerFn = Arc<
    dyn Fn(OperationContext) -> BoxStream<'static, Result<Value, anyhow::Error>> + Send + Sync,
>;
pub(crate) type HookFn =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

pub(crate) enum Handler {
    Call(CallHandlerFn),
    Stream(StreamHandlerFn),
}

/// One invocable unit: a single-result call or a streaming producer.
pub struct Operation {
    pub(crate) name: String,
    pub(crate) docs: Option<String>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) handler: Handler,
}

impl Operation {
    /// Define a single-result operation.
    pub fn call<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            docs: None,
            middleware: Vec::new(),
            handler: Handler::Call(Arc::new(move |ctx| handler(ctx).boxed())),
        }
    }

    /// Define a streaming operation.
    pub fn stream<F, S>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(OperationContext) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<Value, anyhow::Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            docs: None,
            middleware: Vec::new(),
            handler: Handler::Stream(Arc::new(move |ctx| handler(ctx).boxed())),
        }
    }

    /// Attach documentation.
    #[must_use]
    pub fn docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = Some(docs.into());
        self
    }

    /// Append a per-operation middleware. Runs after every
    /// capsule-level middleware, in append order.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call or stream.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self.handler {
            Handler::Call(_) => OperationKind::Call,
            Handler::Stream(_) => OperationKind::Stream,
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

/// Named group of related operations.
#[derive(Debug)]
pub struct Capability {
    pub(crate) name: String,
    pub(crate) docs: Option<String>,
    pub(crate) operations: Vec<Operation>,
}

impl Capability {
    /// Create an empty capability.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: None,
            operations: Vec::new(),
        }
    }

    /// Attach documentation.
    #[must_use]
    pub fn docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = Some(docs.into());
        self
    }

    /// Add an operation.
    #[must_use]
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Capability name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Immutable blueprint for a capsule.
pub struct CapsuleDefinition {
    pub(crate) name: String,
    pub(crate) docs: Option<String>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) capabilities: Vec<Capability>,
    pub(crate) on_boot: Option<HookFn>,
    pub(crate) on_shutdown: Option<HookFn>,
}

impl CapsuleDefinition {
    /// Create an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: None,
            middleware: Vec::new(),
            capabilities: Vec::new(),
            on_boot: None,
            on_shutdown: None,
        }
    }

    /// Attach documentation.
    #[must_use]
    pub fn docs(mut self, docs: impl Into<String>) -> Self {
        self.docs = Some(docs.into());
        self
    }

    /// Append a capsule-level middleware. Runs before every
    /// operation-level middleware, in append order.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Add a capability.
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Set the boot hook, invoked during the created -> booted
    /// transition. Hook failure leaves the capsule created; boot may
    /// be retried.
    #[must_use]
    pub fn on_boot<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.on_boot = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Set the shutdown hook, invoked during the booted -> shutdown
    /// transition. The capsule transitions to shutdown even if the
    /// hook fails.
    #[must_use]
    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.on_shutdown = Some(Arc::new(move |ctx| hook(ctx).boxed()));
        self
    }

    /// Capsule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CapsuleDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleDefinition")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_kinds() {
        let call = Operation::call("add", |ctx| async move { Ok(ctx.params) });
        assert_eq!(call.kind(), OperationKind::Call);

        let stream = Operation::stream("count", |_ctx| {
            futures::stream::iter(vec![Ok(json!(1)), Ok(json!(2))])
        });
        assert_eq!(stream.kind(), OperationKind::Stream);
    }

    #[test]
    fn builder_accumulates() {
        let definition = CapsuleDefinition::new("demo")
            .docs("a demo capsule")
            .capability(
                Capability::new("math")
                    .operation(Operation::call("add", |ctx| async move { Ok(ctx.params) }))
                    .operation(Operation::call("sub", |ctx| async move { Ok(ctx.params) })),
            );

        assert_eq!(definition.name(), "demo");
        assert_eq!(definition.capabilities.len(), 1);
        assert_eq!(definition.capabilities[0].operations.len(), 2);
    }
}
