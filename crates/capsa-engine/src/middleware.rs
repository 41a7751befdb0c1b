//! Middleware pipeline.
//!
//! An ordered chain of interceptors runs before an operation's handler.
//! Capsule-level middleware runs before the target operation's own
//! list; within a list, order is definition order. Each step sees the
//! params as transformed by earlier steps.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use capsa_core::CancelToken;

/// What a middleware step decided about an in-flight invocation.
///
/// The enum is exhaustive by construction: there is no "other shape"
/// for a decision to take.
#[derive(Debug, Clone, PartialEq)]
pub enum MiddlewareDecision {
    /// Pass the params through unchanged.
    Accept,
    /// Replace the params for every subsequent step and the handler.
    Transform(Value),
    /// Abort the invocation; the handler never runs.
    Reject(String),
}

/// Read-only view of an in-flight invocation handed to middleware.
#[derive(Debug)]
pub struct InvocationContext<'a> {
    /// Target capability name.
    pub capability: &'a str,
    /// Target operation name.
    pub operation: &'a str,
    /// Current params (after earlier transforms).
    pub params: &'a Value,
    /// The invocation's cancellation token.
    pub token: &'a CancelToken,
}

/// An interceptor that can approve, rewrite, or reject a trigger
/// before its handler runs.
///
/// Returning an error aborts the chain and fails the trigger; it is
/// distinct from an explicit [`MiddlewareDecision::Reject`].
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect the invocation and decide.
    async fn intercept(
        &self,
        ctx: InvocationContext<'_>,
    ) -> Result<MiddlewareDecision, anyhow::Error>;
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(InvocationContext<'_>) -> Result<MiddlewareDecision, anyhow::Error> + Send + Sync,
{
    async fn intercept(
        &self,
        ctx: InvocationContext<'_>,
    ) -> Result<MiddlewareDecision, anyhow::Error> {
        (self.0)(ctx)
    }
}

/// Wrap a synchronous closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(InvocationContext<'_>) -> Result<MiddlewareDecision, anyhow::Error>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fn_middleware_decides() {
        let mw = middleware_fn(|ctx| {
            if ctx.params.get("admin").and_then(Value::as_bool) == Some(true) {
                Ok(MiddlewareDecision::Accept)
            } else {
                Ok(MiddlewareDecision::Reject("Unauthorized".into()))
            }
        });

        let token = CancelToken::new();
        let params = json!({"admin": true});
        let ctx = InvocationContext {
            capability: "admin",
            operation: "purge",
            params: &params,
            token: &token,
        };
        assert_eq!(mw.intercept(ctx).await.unwrap(), MiddlewareDecision::Accept);

        let params = json!({"admin": false});
        let ctx = InvocationContext {
            capability: "admin",
            operation: "purge",
            params: &params,
            token: &token,
        };
        assert_eq!(
            mw.intercept(ctx).await.unwrap(),
            MiddlewareDecision::Reject("Unauthorized".into())
        );
    }
}
