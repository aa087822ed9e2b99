//! RPC calls of every shape through the RPC router.

use std::time::Duration;

use serde_json::json;

use tetra_router::rpc::{CallOutcome, Frame, RpcCall};
use tetra_router::RouterConfig;

mod common;

#[tokio::test]
async fn unary_calls_bind_the_request() {
    let (routers, _) = common::routers();

    let (call, reply) = RpcCall::unary("/Math/Add", json!({ "a": 2, "b": 3 }));
    let outcome = routers.rpc.handle_call(call).await.unwrap();
    assert_eq!(outcome, CallOutcome::Completed);
    assert_eq!(reply.await.unwrap().unwrap(), json!({ "sum": 5 }));

    let (call, reply) = RpcCall::unary("/Math/Add", json!({ "a": "two", "b": 3 }));
    let outcome = routers.rpc.handle_call(call).await.unwrap();
    assert_eq!(outcome, CallOutcome::Failed(400));
    assert!(reply.await.unwrap().is_err());
}

#[tokio::test]
async fn unknown_methods_fail_on_the_call() {
    let (routers, _) = common::routers();

    let (call, reply) = RpcCall::unary("/Math/Nope", json!({}));
    let outcome = routers.rpc.handle_call(call).await.unwrap();
    assert_eq!(outcome, CallOutcome::Failed(404));
    assert_eq!(reply.await.unwrap().unwrap_err().status().as_u16(), 404);
}

#[tokio::test]
async fn server_streaming_writes_then_ends() {
    let (routers, _) = common::routers();

    let (call, mut frames) = RpcCall::server_streaming("/Math/Count", json!({ "upto": 3 }));
    let outcome = routers.rpc.handle_call(call).await.unwrap();
    assert_eq!(outcome, CallOutcome::Completed);

    let mut received = Vec::new();
    while let Some(frame) = frames.recv().await {
        received.push(frame);
    }
    assert_eq!(
        received,
        vec![
            Frame::Data(json!(1)),
            Frame::Data(json!(2)),
            Frame::Data(json!(3)),
            Frame::End,
        ]
    );
    assert_eq!(routers.registry.app().streams().active_count(), 0);
}

#[tokio::test]
async fn long_server_streams_deliver_every_frame() {
    let (routers, _) = common::routers();
    let rpc = std::sync::Arc::clone(&routers.rpc);

    let (call, mut frames) = RpcCall::server_streaming("/Math/Count", json!({ "upto": 200 }));
    let task = tokio::spawn(async move { rpc.handle_call(call).await });

    let mut data = Vec::new();
    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Data(value) => data.push(value),
            Frame::End => break,
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(data.len(), 200);
    assert_eq!(data.last(), Some(&json!(200)));
    assert_eq!(task.await.unwrap().unwrap(), CallOutcome::Completed);
}

#[tokio::test]
async fn client_streaming_collects_messages() {
    let (routers, _) = common::routers();
    let rpc = std::sync::Arc::clone(&routers.rpc);

    let (call, inbound, reply) = RpcCall::client_streaming("/Math/Sum");
    let task = tokio::spawn(async move { rpc.handle_call(call).await });
    inbound.send(Frame::Data(json!({ "n": 1 }))).await.unwrap();
    inbound.send(Frame::Data(json!({ "n": 2 }))).await.unwrap();
    inbound.send(Frame::End).await.unwrap();

    assert_eq!(reply.await.unwrap().unwrap(), json!({ "total": 3 }));
    assert_eq!(task.await.unwrap().unwrap(), CallOutcome::Completed);
}

#[tokio::test]
async fn client_streaming_is_cancelled_when_the_peer_leaves() {
    let (routers, _) = common::routers();

    let (call, inbound, reply) = RpcCall::client_streaming("/Math/Sum");
    drop(inbound);
    let outcome = routers.rpc.handle_call(call).await.unwrap();
    assert_eq!(outcome, CallOutcome::Cancelled);
    assert!(reply.await.unwrap().is_err());
}

#[tokio::test]
async fn bidirectional_answers_each_message() {
    let (routers, _) = common::routers();
    let rpc = std::sync::Arc::clone(&routers.rpc);

    let (call, inbound, mut outbound) = RpcCall::bidirectional("/Math/Double");
    let task = tokio::spawn(async move { rpc.handle_call(call).await });

    inbound.send(Frame::Data(json!(2))).await.unwrap();
    assert_eq!(outbound.recv().await, Some(Frame::Data(json!(4))));
    inbound.send(Frame::Data(json!(5))).await.unwrap();
    assert_eq!(outbound.recv().await, Some(Frame::Data(json!(10))));
    inbound.send(Frame::End).await.unwrap();
    assert_eq!(outbound.recv().await, Some(Frame::End));

    assert_eq!(task.await.unwrap().unwrap(), CallOutcome::Completed);
}

#[tokio::test]
async fn registry_cleanup_ends_open_streams() {
    let (routers, _) = common::routers();
    let rpc = std::sync::Arc::clone(&routers.rpc);

    let (call, inbound, mut outbound) = RpcCall::bidirectional("/Math/Double");
    let task = tokio::spawn(async move { rpc.handle_call(call).await });
    inbound.send(Frame::Data(json!(1))).await.unwrap();
    assert_eq!(outbound.recv().await, Some(Frame::Data(json!(2))));

    assert!(routers.registry.cleanup().await);
    let frame = tokio::time::timeout(Duration::from_secs(1), outbound.recv()).await.unwrap();
    assert!(matches!(frame, Some(Frame::Error { status: 499, .. })));
    let outcome = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, CallOutcome::Cancelled);
    assert_eq!(routers.registry.app().streams().active_count(), 0);

    let (call, _inbound, mut outbound) = RpcCall::bidirectional("/Math/Double");
    assert_eq!(routers.rpc.handle_call(call).await.unwrap(), CallOutcome::Rejected);
    assert!(matches!(outbound.recv().await, Some(Frame::Error { status: 503, .. })));
}

#[tokio::test]
async fn slow_calls_time_out() {
    let mut config = RouterConfig::default();
    config.rpc.stream_timeout_ms = 50;
    let (routers, _) = common::routers_with(config);

    let (call, reply) = RpcCall::unary("/Math/Slow", json!({}));
    let outcome = routers.rpc.handle_call(call).await.unwrap();
    assert_eq!(outcome, CallOutcome::TimedOut);
    assert_eq!(reply.await.unwrap().unwrap_err().status().as_u16(), 504);
}

#[tokio::test]
async fn per_path_timeouts_override_the_default() {
    let (routers, _) = common::routers();
    routers.rpc.set_timeout("/Math/Slow", Duration::from_millis(20)).unwrap();

    let (call, _reply) = RpcCall::unary("/Math/Slow", json!({}));
    let outcome = tokio::time::timeout(Duration::from_secs(2), routers.rpc.handle_call(call))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, CallOutcome::TimedOut);
}

#[tokio::test]
async fn streams_past_the_ceiling_are_rejected() {
    let mut config = RouterConfig::default();
    config.rpc.max_concurrent_streams = 1;
    let (routers, _) = common::routers_with(config);
    let streams = std::sync::Arc::clone(routers.registry.app().streams());

    let rpc = std::sync::Arc::clone(&routers.rpc);
    let (first, first_in, _first_out) = RpcCall::bidirectional("/Math/Double");
    let held = tokio::spawn(async move { rpc.handle_call(first).await });
    while streams.active_count() == 0 {
        tokio::task::yield_now().await;
    }

    let (second, _second_in, mut second_out) = RpcCall::bidirectional("/Math/Double");
    let outcome = routers.rpc.handle_call(second).await.unwrap();
    assert_eq!(outcome, CallOutcome::Rejected);
    assert!(matches!(second_out.recv().await, Some(Frame::Error { status: 503, .. })));

    // Unary calls never count against the ceiling.
    let (call, reply) = RpcCall::unary("/Math/Add", json!({ "a": 1, "b": 1 }));
    assert_eq!(routers.rpc.handle_call(call).await.unwrap(), CallOutcome::Completed);
    assert_eq!(reply.await.unwrap().unwrap(), json!({ "sum": 2 }));

    first_in.send(Frame::End).await.unwrap();
    assert_eq!(held.await.unwrap().unwrap(), CallOutcome::Completed);
}
