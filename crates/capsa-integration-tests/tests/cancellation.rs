//! Cancellation relayed across the wire.

mod common;

use common::{calculator, connect};

use capsa_core::{CancelToken, EngineError};
use capsa_engine::{Capability, CapsuleDefinition, Operation};
use capsa_remote::RemoteError;
use futures::StreamExt;
use serde_json::{json, Value};

/// A stream that yields `ready` items immediately, then parks forever.
fn parking_counter(ready: u64) -> CapsuleDefinition {
    CapsuleDefinition::new("parking").capability(Capability::new("seq").operation(
        Operation::stream("count", move |_ctx| {
            futures::stream::unfold(0u64, move |n| async move {
                if n >= ready {
                    futures::future::pending::<()>().await;
                }
                Some((Ok(json!(n.saturating_add(1))), n.saturating_add(1)))
            })
            .boxed()
        }),
    ))
}

#[tokio::test]
async fn cancelling_after_two_items_ends_the_stream_with_the_reason() {
    let pair = connect(parking_counter(2)).await;

    let token = CancelToken::new();
    let reply = pair
        .facade
        .trigger("seq", "count", Value::Null, Some(token.clone()))
        .await
        .unwrap();
    let mut stream = reply.into_stream().unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(2));

    token.cancel("consumer done");
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.to_string().contains("consumer done"));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn pre_cancelled_token_never_reaches_the_remote_engine() {
    let pair = connect(calculator()).await;

    let token = CancelToken::new();
    token.cancel("too late");
    let err = pair
        .facade
        .trigger("math", "add", json!({"a": 1, "b": 1}), Some(token))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RemoteError::Engine(EngineError::Aborted { .. })
    ));
    assert_eq!(pair.capsule.inflight_count(), 0);
}

#[tokio::test]
async fn aborting_a_slow_call_fails_it_with_an_abort_error() {
    let definition = CapsuleDefinition::new("sluggish").capability(
        Capability::new("job").operation(Operation::call("run", |ctx| async move {
            // Cooperative: wait for cancellation rather than finish.
            let reason = ctx.token.cancelled().await;
            Err(anyhow::anyhow!("aborted: {reason}"))
        })),
    );
    let pair = connect(definition).await;

    let token = CancelToken::new();
    let facade = std::sync::Arc::clone(&pair.facade);
    let caller_token = token.clone();
    let call = tokio::spawn(async move {
        facade
            .trigger("job", "run", Value::Null, Some(caller_token))
            .await
    });

    // Let the trigger reach the remote engine before aborting.
    tokio::task::yield_now().await;
    token.cancel("operator stop");

    let err = call.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("operator stop"));
}

#[tokio::test]
async fn abort_leaves_no_inflight_entry_behind() {
    let pair = connect(parking_counter(1)).await;

    let token = CancelToken::new();
    let reply = pair
        .facade
        .trigger("seq", "count", Value::Null, Some(token.clone()))
        .await
        .unwrap();
    let mut stream = reply.into_stream().unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));

    token.cancel("done");
    assert!(stream.next().await.unwrap().is_err());

    // The guarded stream has been dropped on the runner side; its
    // in-flight entry goes with it.
    tokio::task::yield_now().await;
    assert_eq!(pair.capsule.inflight_count(), 0);
}
