//! Transport-neutral RPC call objects.
//!
//! A transport adapter turns each incoming call into an [`RpcCall`] holding
//! whichever channels the call actually has. [`RpcCall::into_stream`]
//! classifies it once and produces an [`RpcStream`] carrying only the state
//! its shape needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::context::Context;
use crate::error::{RouterError, RouterResult};
use crate::rpc::stream::{classify, StreamKind, StreamManager};

/// Capacity of the channels created by the call constructors.
pub const CHANNEL_CAPACITY: usize = 64;

/// One message on an RPC stream, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Value),
    End,
    Error { status: u16, message: String },
    /// Sent by the client to abandon the call.
    Cancelled,
}

impl Frame {
    pub fn error(error: &RouterError) -> Self {
        Frame::Error {
            status: error.status().as_u16(),
            message: error.to_string(),
        }
    }
}

/// Encoded size of a message, used for buffer accounting.
pub fn message_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

pub type ReplySender = oneshot::Sender<RouterResult<Value>>;
pub type ReplyReceiver = oneshot::Receiver<RouterResult<Value>>;

/// An incoming call as the transport hands it over.
#[derive(Debug)]
pub struct RpcCall {
    /// `/Service/Method`.
    pub path: String,
    pub metadata: HeaderMap,
    pub request: Option<Value>,
    pub inbound: Option<mpsc::Receiver<Frame>>,
    pub outbound: Option<mpsc::Sender<Frame>>,
    pub reply: Option<ReplySender>,
}

impl RpcCall {
    fn bare(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            metadata: HeaderMap::new(),
            request: None,
            inbound: None,
            outbound: None,
            reply: None,
        }
    }

    /// Single request, single reply.
    pub fn unary(path: impl Into<String>, request: Value) -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let mut call = Self::bare(path);
        call.request = Some(request);
        call.reply = Some(tx);
        (call, rx)
    }

    /// Single request, stream of replies.
    pub fn server_streaming(path: impl Into<String>, request: Value) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut call = Self::bare(path);
        call.request = Some(request);
        call.outbound = Some(tx);
        (call, rx)
    }

    /// Stream of requests, single reply.
    pub fn client_streaming(path: impl Into<String>) -> (Self, mpsc::Sender<Frame>, ReplyReceiver) {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut call = Self::bare(path);
        call.inbound = Some(in_rx);
        call.reply = Some(reply_tx);
        (call, in_tx, reply_rx)
    }

    /// Streams both ways.
    pub fn bidirectional(path: impl Into<String>) -> (Self, mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut call = Self::bare(path);
        call.inbound = Some(in_rx);
        call.outbound = Some(out_tx);
        (call, in_tx, out_rx)
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn readable(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn writable(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn kind(&self) -> StreamKind {
        classify(self.readable(), self.writable())
    }

    /// Classify and split the call. Fails when the call lacks what its
    /// shape needs, e.g. a unary call without a request payload.
    pub fn into_stream(self) -> RouterResult<(CallHead, RpcStream)> {
        let kind = self.kind();
        let head = CallHead {
            path: self.path,
            metadata: self.metadata,
        };
        let missing = |what: &str| {
            RouterError::config(format!("{} call to {} has no {what}", kind.as_str(), head.path))
        };
        let stream = match kind {
            StreamKind::Unary => RpcStream::Unary {
                request: self.request.ok_or_else(|| missing("request"))?,
                reply: self.reply.ok_or_else(|| missing("reply channel"))?,
            },
            StreamKind::ServerStreaming => RpcStream::ServerStreaming {
                request: self.request.unwrap_or(Value::Null),
                sink: self.outbound.ok_or_else(|| missing("outbound channel"))?,
            },
            StreamKind::ClientStreaming => RpcStream::ClientStreaming {
                source: self.inbound.ok_or_else(|| missing("inbound channel"))?,
                reply: self.reply.ok_or_else(|| missing("reply channel"))?,
            },
            StreamKind::Bidirectional => RpcStream::Bidirectional {
                source: self.inbound.ok_or_else(|| missing("inbound channel"))?,
                sink: self.outbound.ok_or_else(|| missing("outbound channel"))?,
            },
        };
        Ok((head, stream))
    }
}

/// Addressing shared by every shape.
#[derive(Debug, Clone)]
pub struct CallHead {
    pub path: String,
    pub metadata: HeaderMap,
}

/// A classified call.
#[derive(Debug)]
pub enum RpcStream {
    Unary {
        request: Value,
        reply: ReplySender,
    },
    ServerStreaming {
        request: Value,
        sink: mpsc::Sender<Frame>,
    },
    ClientStreaming {
        source: mpsc::Receiver<Frame>,
        reply: ReplySender,
    },
    Bidirectional {
        source: mpsc::Receiver<Frame>,
        sink: mpsc::Sender<Frame>,
    },
}

impl RpcStream {
    pub fn kind(&self) -> StreamKind {
        match self {
            RpcStream::Unary { .. } => StreamKind::Unary,
            RpcStream::ServerStreaming { .. } => StreamKind::ServerStreaming,
            RpcStream::ClientStreaming { .. } => StreamKind::ClientStreaming,
            RpcStream::Bidirectional { .. } => StreamKind::Bidirectional,
        }
    }
}

/// Write side of a streaming call, handed to controllers through the
/// context's extensions.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    id: u64,
    sink: mpsc::Sender<Frame>,
    manager: Arc<StreamManager>,
    ended: Arc<AtomicBool>,
}

impl StreamWriter {
    pub fn new(id: u64, sink: mpsc::Sender<Frame>, manager: Arc<StreamManager>) -> Self {
        Self {
            id,
            sink,
            manager,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The writer attached to `ctx`, if the call streams replies.
    pub fn from_context(ctx: &Context) -> Option<StreamWriter> {
        ctx.extensions().get::<StreamWriter>().cloned()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue one message, waiting for channel capacity while the peer
    /// drains. Returns `false` without writing when the stream has ended, is
    /// over its backpressure threshold, or the peer is gone.
    pub async fn write(&self, value: Value) -> bool {
        if self.is_ended() {
            return false;
        }
        if !self.manager.record_outbound(self.id, message_size(&value)) {
            return false;
        }
        self.sink.send(Frame::Data(value)).await.is_ok()
    }

    /// Finish the stream. Later writes are refused.
    pub async fn end_stream(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            let _ = self.sink.send(Frame::End).await;
        }
    }

    /// Finish the stream with an error frame.
    pub async fn fail(&self, error: &RouterError) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            let _ = self.sink.send(Frame::error(error)).await;
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Stop accepting writes without sending anything.
    pub(crate) fn close(&self) {
        self.ended.store(true, Ordering::Release);
    }
}
