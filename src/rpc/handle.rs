//! Per-shape call handling.
//!
//! Every shape runs under one deadline and ends early when the stream
//! manager is cleaned up. Controller invocations are spawned: a deadline or
//! cancellation stops waiting for them and discards whatever they eventually
//! produce, but never aborts them.
//!
//! Bidirectional calls invoke the controller once per inbound message and
//! read the next message only after that invocation finished, so replies
//! keep the order of their requests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::context::{Context, Protocol};
use crate::error::{RouterError, RouterResult, StreamError};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::rpc::call::{message_size, CallHead, Frame, ReplySender, RpcCall, RpcStream, StreamWriter};
use crate::rpc::stream::{InboundAction, StreamKind, StreamManager, StreamRegistration};

/// Runs one invocation of the routed controller method.
pub type Dispatch = Arc<dyn Fn(Context) -> BoxFuture<'static, RouterResult<Context>> + Send + Sync>;

/// How a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Completed,
    /// Ended with an error of this status.
    Failed(u16),
    TimedOut,
    Cancelled,
    /// Refused by the concurrency gate.
    Rejected,
}

impl CallOutcome {
    fn from_error(error: &RouterError) -> Self {
        match error {
            RouterError::Stream(StreamError::Timeout(_)) => CallOutcome::TimedOut,
            RouterError::Stream(StreamError::Cancelled(_)) => CallOutcome::Cancelled,
            other => CallOutcome::Failed(other.status().as_u16()),
        }
    }
}

/// Serve one call to completion.
///
/// Errors only when the call object is malformed; every other failure is
/// delivered to the peer and reported in the outcome.
pub async fn serve_call(
    manager: Arc<StreamManager>,
    call: RpcCall,
    dispatch: Dispatch,
) -> RouterResult<CallOutcome> {
    let (head, stream) = call.into_stream()?;
    let kind = stream.kind();

    let id = match manager.register(kind) {
        Ok(id) => id,
        Err(error) => {
            reject(stream, &RouterError::from(error)).await;
            return Ok(CallOutcome::Rejected);
        }
    };
    let _registration =
        (kind != StreamKind::Unary).then(|| StreamRegistration::new(Arc::clone(&manager), id));

    let span = tracing::info_span!("rpc_call", stream_id = id, kind = kind.as_str(), path = %head.path);
    let supervisor = Supervisor {
        id,
        kind,
        timeout: manager.timeout_for(&head.path),
        closing: manager.closing().clone(),
        manager,
        dispatch,
        head,
    };

    let outcome = async move {
        let outcome = match stream {
            RpcStream::Unary { request, reply } => supervisor.unary(request, reply).await,
            RpcStream::ServerStreaming { request, sink } => supervisor.server_streaming(request, sink).await,
            RpcStream::ClientStreaming { source, reply } => supervisor.client_streaming(source, reply).await,
            RpcStream::Bidirectional { source, sink } => supervisor.bidirectional(source, sink).await,
        };
        if outcome == CallOutcome::TimedOut {
            metrics::record_stream_timeout(kind.as_str());
            tracing::warn!("RPC call timed out");
        } else {
            tracing::debug!(?outcome, "RPC call finished");
        }
        outcome
    }
    .instrument(span)
    .await;
    Ok(outcome)
}

async fn reject(stream: RpcStream, error: &RouterError) {
    match stream {
        RpcStream::Unary { reply, .. } | RpcStream::ClientStreaming { reply, .. } => {
            let _ = reply.send(Err(clone_error(error)));
        }
        RpcStream::ServerStreaming { sink, .. } | RpcStream::Bidirectional { sink, .. } => {
            let _ = sink.try_send(Frame::error(error));
        }
    }
}

/// Stream errors are cheap to copy; anything else is carried over by status
/// and message.
fn clone_error(error: &RouterError) -> RouterError {
    match error {
        RouterError::Stream(e) => RouterError::Stream(e.clone()),
        other => RouterError::handler(other.status(), other.to_string()),
    }
}

struct Supervisor {
    id: u64,
    kind: StreamKind,
    timeout: Duration,
    closing: Shutdown,
    manager: Arc<StreamManager>,
    dispatch: Dispatch,
    head: CallHead,
}

impl Supervisor {
    fn context(&self, payload: Value) -> Context {
        Context::new(Protocol::Grpc, "RPC", self.head.path.clone())
            .with_headers(self.head.metadata.clone())
            .with_payload(payload)
    }

    fn spawn(&self, ctx: Context) -> JoinHandle<RouterResult<Value>> {
        let dispatch = Arc::clone(&self.dispatch);
        tokio::spawn(async move {
            let mut ctx = dispatch(ctx).await?;
            Ok(ctx.take_body().unwrap_or(Value::Null))
        })
    }

    fn timed_out(&self) -> RouterError {
        StreamError::Timeout(self.id).into()
    }

    fn shut_down(&self) -> RouterError {
        tracing::debug!(stream_id = self.id, "Ending RPC call, stream manager cleaned up");
        StreamError::Cancelled(self.id).into()
    }

    /// Wait for an invocation; dropping the handle detaches it.
    async fn join(handle: JoinHandle<RouterResult<Value>>) -> RouterResult<Value> {
        match handle.await {
            Ok(result) => result,
            Err(error) => Err(RouterError::handler(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("handler task failed: {error}"),
            )),
        }
    }

    /// Apply inbound accounting, sleeping out a pause if one is requested.
    async fn accept_inbound(&self, value: &Value, deadline: &mut std::pin::Pin<&mut tokio::time::Sleep>) -> RouterResult<()> {
        match self.manager.record_inbound(self.id, message_size(value))? {
            InboundAction::Continue => Ok(()),
            InboundAction::Pause(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.manager.resume(self.id);
                        Ok(())
                    }
                    _ = deadline.as_mut() => Err(self.timed_out()),
                    _ = self.closing.wait() => Err(self.shut_down()),
                }
            }
        }
    }

    async fn unary(self, request: Value, reply: ReplySender) -> CallOutcome {
        let task = self.spawn(self.context(request));
        let result = tokio::select! {
            result = tokio::time::timeout(self.timeout, Self::join(task)) => match result {
                Ok(result) => result,
                Err(_) => Err(self.timed_out()),
            },
            _ = self.closing.wait() => Err(self.shut_down()),
        };
        let outcome = match &result {
            Ok(_) => CallOutcome::Completed,
            Err(error) => CallOutcome::from_error(error),
        };
        let _ = reply.send(result);
        outcome
    }

    async fn server_streaming(self, request: Value, sink: mpsc::Sender<Frame>) -> CallOutcome {
        let writer = StreamWriter::new(self.id, sink.clone(), Arc::clone(&self.manager));
        let mut ctx = self.context(request);
        ctx.extensions_mut().insert(writer.clone());
        let task = self.spawn(ctx);

        tokio::select! {
            result = Self::join(task) => match result {
                Ok(value) => {
                    if !value.is_null() {
                        writer.write(value).await;
                    }
                    writer.end_stream().await;
                    CallOutcome::Completed
                }
                Err(error) => {
                    writer.fail(&error).await;
                    CallOutcome::from_error(&error)
                }
            },
            _ = sink.closed() => {
                writer.close();
                CallOutcome::Cancelled
            }
            _ = tokio::time::sleep(self.timeout) => {
                writer.close();
                let _ = sink.try_send(Frame::error(&self.timed_out()));
                CallOutcome::TimedOut
            }
            _ = self.closing.wait() => {
                writer.close();
                let _ = sink.try_send(Frame::error(&self.shut_down()));
                CallOutcome::Cancelled
            }
        }
    }

    async fn client_streaming(self, mut source: mpsc::Receiver<Frame>, reply: ReplySender) -> CallOutcome {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let cap = self.manager.settings().max_client_stream_bytes;
        let mut messages = Vec::new();
        let mut total = 0usize;

        let result: RouterResult<Value> = loop {
            let frame = tokio::select! {
                frame = source.recv() => frame,
                _ = deadline.as_mut() => break Err(self.timed_out()),
                _ = self.closing.wait() => break Err(self.shut_down()),
            };
            match frame {
                Some(Frame::Data(value)) => {
                    if let Err(error) = self.accept_inbound(&value, &mut deadline).await {
                        break Err(error);
                    }
                    total += message_size(&value);
                    if let Some(limit) = cap.filter(|limit| total > *limit) {
                        break Err(StreamError::MessageTooLarge { size: total, limit }.into());
                    }
                    messages.push(value);
                }
                Some(Frame::End) => {
                    tracing::debug!(messages = messages.len(), bytes = total, "Client stream complete");
                    let task = self.spawn(self.context(Value::Array(std::mem::take(&mut messages))));
                    break tokio::select! {
                        result = Self::join(task) => result,
                        _ = deadline.as_mut() => Err(self.timed_out()),
                        _ = self.closing.wait() => Err(self.shut_down()),
                    };
                }
                Some(Frame::Cancelled) | None => break Err(StreamError::Cancelled(self.id).into()),
                Some(Frame::Error { message, .. }) => {
                    break Err(StreamError::Failed { id: self.id, message }.into())
                }
            }
        };

        let outcome = match &result {
            Ok(_) => CallOutcome::Completed,
            Err(error) => CallOutcome::from_error(error),
        };
        let _ = reply.send(result);
        outcome
    }

    async fn bidirectional(self, mut source: mpsc::Receiver<Frame>, sink: mpsc::Sender<Frame>) -> CallOutcome {
        let writer = StreamWriter::new(self.id, sink.clone(), Arc::clone(&self.manager));
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                frame = source.recv() => frame,
                _ = sink.closed() => None,
                _ = deadline.as_mut() => {
                    writer.close();
                    let _ = sink.try_send(Frame::error(&self.timed_out()));
                    return CallOutcome::TimedOut;
                }
                _ = self.closing.wait() => {
                    writer.close();
                    let _ = sink.try_send(Frame::error(&self.shut_down()));
                    return CallOutcome::Cancelled;
                }
            };
            match frame {
                Some(Frame::Data(value)) => {
                    if let Err(error) = self.accept_inbound(&value, &mut deadline).await {
                        let outcome = CallOutcome::from_error(&error);
                        writer.close();
                        let _ = sink.try_send(Frame::error(&error));
                        return outcome;
                    }
                    let mut ctx = self.context(value);
                    ctx.extensions_mut().insert(writer.clone());
                    let task = self.spawn(ctx);
                    let result = tokio::select! {
                        result = Self::join(task) => result,
                        _ = deadline.as_mut() => Err(self.timed_out()),
                        _ = self.closing.wait() => Err(self.shut_down()),
                    };
                    match result {
                        Ok(value) => {
                            if !value.is_null() {
                                writer.write(value).await;
                            }
                        }
                        Err(error) => {
                            let outcome = CallOutcome::from_error(&error);
                            if matches!(outcome, CallOutcome::TimedOut | CallOutcome::Cancelled) {
                                writer.close();
                                let _ = sink.try_send(Frame::error(&error));
                            } else {
                                writer.fail(&error).await;
                            }
                            return outcome;
                        }
                    }
                    if writer.is_ended() {
                        return CallOutcome::Completed;
                    }
                }
                Some(Frame::End) => {
                    writer.end_stream().await;
                    return CallOutcome::Completed;
                }
                Some(Frame::Cancelled) | None => {
                    writer.close();
                    return CallOutcome::Cancelled;
                }
                Some(Frame::Error { message, .. }) => {
                    writer.close();
                    tracing::warn!(stream_id = self.id, %message, "Peer reported a stream error");
                    return CallOutcome::Failed(500);
                }
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("path", &self.head.path)
            .field("timeout", &self.timeout)
            .finish()
    }
}
