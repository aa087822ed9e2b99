//! RPC stream classification and supervision.
//!
//! # Responsibilities
//! - Classify calls into the four streaming shapes
//! - Track per-stream activity, message counts and buffered bytes
//! - Refuse new streams past the concurrency ceiling
//! - Advise pause/resume when inbound data piles up
//! - Sweep states that never saw a terminal event
//! - Signal every live call to end on cleanup
//!
//! Unary calls are never registered and never count against the ceiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RpcConfig;
use crate::error::StreamError;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Unary => "unary",
            StreamKind::ServerStreaming => "server_streaming",
            StreamKind::ClientStreaming => "client_streaming",
            StreamKind::Bidirectional => "bidirectional",
        }
    }
}

/// Shape of a call from its capabilities: whether the client streams to us
/// (`readable`) and whether we stream back (`writable`).
pub fn classify(readable: bool, writable: bool) -> StreamKind {
    match (readable, writable) {
        (false, false) => StreamKind::Unary,
        (false, true) => StreamKind::ServerStreaming,
        (true, false) => StreamKind::ClientStreaming,
        (true, true) => StreamKind::Bidirectional,
    }
}

/// Snapshot of one stream's bookkeeping.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub id: u64,
    pub kind: StreamKind,
    pub started: Instant,
    pub last_activity: Instant,
    pub message_count: u64,
    pub buffered_bytes: usize,
    pub active: bool,
    pub paused: bool,
}

impl StreamState {
    fn new(id: u64, kind: StreamKind) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind,
            started: now,
            last_activity: now,
            message_count: 0,
            buffered_bytes: 0,
            active: true,
            paused: false,
        }
    }
}

/// What the reader should do after accounting an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAction {
    Continue,
    /// Stop reading, wait this long, then call [`StreamManager::resume`].
    Pause(Duration),
}

/// Registry of in-flight non-unary streams.
#[derive(Debug)]
pub struct StreamManager {
    settings: RpcConfig,
    states: Mutex<HashMap<u64, StreamState>>,
    path_timeouts: DashMap<String, Duration>,
    next_id: AtomicU64,
    closing: Shutdown,
}

impl StreamManager {
    pub fn new(settings: RpcConfig) -> Self {
        Self {
            settings,
            states: Mutex::new(HashMap::new()),
            path_timeouts: DashMap::new(),
            next_id: AtomicU64::new(1),
            closing: Shutdown::new(),
        }
    }

    pub fn settings(&self) -> &RpcConfig {
        &self.settings
    }

    /// Fires once [`StreamManager::cleanup`] has run. Supervisors end their
    /// calls on it.
    pub fn closing(&self) -> &Shutdown {
        &self.closing
    }

    /// Override the stream timeout for one RPC path.
    pub fn set_path_timeout(&self, path: impl Into<String>, timeout: Duration) {
        self.path_timeouts.insert(path.into(), timeout);
    }

    pub fn timeout_for(&self, path: &str) -> Duration {
        self.path_timeouts
            .get(path)
            .map(|t| *t.value())
            .unwrap_or_else(|| Duration::from_millis(self.settings.stream_timeout_ms))
    }

    /// Allocate an id for a new call and, unless it is unary, register it.
    ///
    /// Stale states are swept first. Fails with `ServerBusy` at the ceiling,
    /// leaving the active count unchanged, and with `Closed` after cleanup.
    pub fn register(&self, kind: StreamKind) -> Result<u64, StreamError> {
        if self.closing.is_triggered() {
            return Err(StreamError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if kind == StreamKind::Unary {
            return Ok(id);
        }

        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        let swept = Self::sweep_locked(&mut states, self.stale_after());
        if swept > 0 {
            tracing::warn!(swept, "Swept stale RPC streams");
        }

        let active = states.len();
        let limit = self.settings.max_concurrent_streams;
        if active >= limit {
            drop(states);
            metrics::record_stream_rejected();
            tracing::warn!(active, limit, kind = kind.as_str(), "Rejecting RPC stream, server busy");
            return Err(StreamError::ServerBusy { active, limit });
        }

        states.insert(id, StreamState::new(id, kind));
        let active = states.len();
        drop(states);
        metrics::record_active_streams(active);
        tracing::debug!(stream_id = id, kind = kind.as_str(), active, "RPC stream registered");
        Ok(id)
    }

    /// Remove a stream's state. Returns whether it was registered.
    pub fn deregister(&self, id: u64) -> bool {
        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        let removed = states.remove(&id).is_some();
        let active = states.len();
        drop(states);
        if removed {
            metrics::record_active_streams(active);
            tracing::debug!(stream_id = id, active, "RPC stream deregistered");
        }
        removed
    }

    /// Account an inbound message of `bytes` bytes.
    pub fn record_inbound(&self, id: u64, bytes: usize) -> Result<InboundAction, StreamError> {
        let limit = self.settings.buffer_size;
        if bytes > limit {
            return Err(StreamError::MessageTooLarge { size: bytes, limit });
        }
        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        let Some(state) = states.get_mut(&id) else {
            return Ok(InboundAction::Continue);
        };
        state.message_count += 1;
        state.buffered_bytes += bytes;
        state.last_activity = Instant::now();
        if state.buffered_bytes > self.settings.backpressure_threshold {
            state.paused = true;
            tracing::debug!(
                stream_id = id,
                buffered_bytes = state.buffered_bytes,
                "Backpressure triggered, pausing inbound"
            );
            return Ok(InboundAction::Pause(Duration::from_millis(self.settings.resume_delay_ms)));
        }
        Ok(InboundAction::Continue)
    }

    /// Resume a paused stream; its buffer counts as drained.
    pub fn resume(&self, id: u64) {
        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        if let Some(state) = states.get_mut(&id) {
            state.paused = false;
            state.buffered_bytes = 0;
        }
    }

    /// Account an outbound message. Returns `false` when it must not be
    /// written: too large, or the stream is over its backpressure threshold.
    pub fn record_outbound(&self, id: u64, bytes: usize) -> bool {
        if bytes > self.settings.buffer_size {
            return false;
        }
        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        match states.get_mut(&id) {
            Some(state) if state.buffered_bytes > self.settings.backpressure_threshold => false,
            Some(state) => {
                state.message_count += 1;
                state.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_backpressure_triggered(&self, id: u64) -> bool {
        self.states
            .lock()
            .expect("stream registry mutex poisoned")
            .get(&id)
            .is_some_and(|s| s.buffered_bytes > self.settings.backpressure_threshold)
    }

    pub fn set_buffered_bytes(&self, id: u64, bytes: usize) {
        if let Some(state) = self
            .states
            .lock()
            .expect("stream registry mutex poisoned")
            .get_mut(&id)
        {
            state.buffered_bytes = bytes;
        }
    }

    pub fn get(&self, id: u64) -> Option<StreamState> {
        self.states
            .lock()
            .expect("stream registry mutex poisoned")
            .get(&id)
            .cloned()
    }

    pub fn active_count(&self) -> usize {
        self.states.lock().expect("stream registry mutex poisoned").len()
    }

    /// Drop every state older than twice the stream timeout.
    pub fn sweep_stale(&self) -> usize {
        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        let swept = Self::sweep_locked(&mut states, self.stale_after());
        let active = states.len();
        drop(states);
        if swept > 0 {
            metrics::record_active_streams(active);
        }
        swept
    }

    /// End every live call and deregister everything. Later registrations
    /// are refused. Returns the number of streams dropped.
    pub fn cleanup(&self) -> usize {
        self.closing.trigger();
        let mut states = self.states.lock().expect("stream registry mutex poisoned");
        let dropped = states.len();
        states.clear();
        drop(states);
        metrics::record_active_streams(0);
        if dropped > 0 {
            tracing::info!(dropped, "RPC streams cleaned up");
        }
        dropped
    }

    fn stale_after(&self) -> Duration {
        Duration::from_millis(self.settings.stream_timeout_ms.saturating_mul(2))
    }

    fn sweep_locked(states: &mut HashMap<u64, StreamState>, stale_after: Duration) -> usize {
        let before = states.len();
        states.retain(|_, state| state.started.elapsed() <= stale_after);
        before - states.len()
    }
}

/// Deregisters its stream when dropped, whatever path ended the call.
#[derive(Debug)]
pub struct StreamRegistration {
    manager: Arc<StreamManager>,
    id: u64,
}

impl StreamRegistration {
    pub fn new(manager: Arc<StreamManager>, id: u64) -> Self {
        Self { manager, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.manager.deregister(self.id);
    }
}
