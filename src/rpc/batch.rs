//! Best-effort coalescing of outbound calls.
//!
//! Requests queue per service and flush together once `batch_size` items are
//! waiting or `batch_timeout` has passed since the first one arrived. Items of
//! a batch run concurrently and resolve independently; one failure never
//! affects the others.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::app::Resource;
use crate::config::PoolConfig;
use crate::error::{RouterError, RouterResult};
use crate::observability::metrics;

/// Executes one queued request against a service.
pub type Executor<Req, Resp> = Arc<dyn Fn(String, Req) -> BoxFuture<'static, RouterResult<Resp>> + Send + Sync>;

struct Pending<Req, Resp> {
    request: Req,
    reply: oneshot::Sender<RouterResult<Resp>>,
}

struct Queue<Req, Resp> {
    items: Vec<Pending<Req, Resp>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl<Req, Resp> Default for Queue<Req, Resp> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            generation: 0,
            timer: None,
        }
    }
}

struct Inner<Req, Resp> {
    batch_size: usize,
    batch_timeout: Duration,
    executor: Executor<Req, Resp>,
    queues: Mutex<HashMap<String, Queue<Req, Resp>>>,
    closed: AtomicBool,
}

impl<Req: Send + 'static, Resp: Send + 'static> Inner<Req, Resp> {
    /// Take everything queued for `service` and cancel its timer.
    fn take(&self, service: &str) -> Vec<Pending<Req, Resp>> {
        let mut queues = self.queues.lock().expect("batch queue mutex poisoned");
        match queues.get_mut(service) {
            Some(queue) => Self::take_queue(queue),
            None => Vec::new(),
        }
    }

    fn take_queue(queue: &mut Queue<Req, Resp>) -> Vec<Pending<Req, Resp>> {
        queue.generation += 1;
        if let Some(timer) = queue.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut queue.items)
    }

    /// Timer expiry: flush only if nothing flushed the queue in the meantime.
    fn take_if_generation(&self, service: &str, generation: u64) -> Vec<Pending<Req, Resp>> {
        let mut queues = self.queues.lock().expect("batch queue mutex poisoned");
        match queues.get_mut(service) {
            Some(queue) if queue.generation == generation => {
                // This is the running timer task; it must not abort itself.
                queue.timer = None;
                queue.generation += 1;
                std::mem::take(&mut queue.items)
            }
            _ => Vec::new(),
        }
    }

    async fn run_batch(&self, service: String, batch: Vec<Pending<Req, Resp>>) {
        if batch.is_empty() {
            return;
        }
        metrics::record_batch_flush(&service, batch.len());
        tracing::debug!(service = %service, size = batch.len(), "Flushing batch");
        let calls = batch.into_iter().map(|pending| {
            let call = (self.executor)(service.clone(), pending.request);
            let service = service.as_str();
            async move {
                let result = call.await;
                if let Err(error) = &result {
                    tracing::warn!(service, %error, "Batched request failed");
                }
                let _ = pending.reply.send(result);
            }
        });
        join_all(calls).await;
    }
}

/// Per-service request coalescer.
pub struct BatchProcessor<Req, Resp> {
    inner: Arc<Inner<Req, Resp>>,
}

impl<Req: Send + 'static, Resp: Send + 'static> BatchProcessor<Req, Resp> {
    pub fn new<F, Fut>(batch_size: usize, batch_timeout: Duration, executor: F) -> Self
    where
        F: Fn(String, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RouterResult<Resp>> + Send + 'static,
    {
        let executor: Executor<Req, Resp> = Arc::new(move |service, req| Box::pin(executor(service, req)));
        Self {
            inner: Arc::new(Inner {
                batch_size: batch_size.max(1),
                batch_timeout,
                executor,
                queues: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config<F, Fut>(config: &PoolConfig, executor: F) -> Self
    where
        F: Fn(String, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RouterResult<Resp>> + Send + 'static,
    {
        Self::new(
            config.batch_size,
            Duration::from_millis(config.batch_timeout_ms),
            executor,
        )
    }

    /// Queue a request. The returned future resolves to this request's own
    /// result once its batch has run.
    pub fn add_request(
        &self,
        service: impl Into<String>,
        request: Req,
    ) -> impl Future<Output = RouterResult<Resp>> + Send + 'static {
        let service = service.into();
        let (tx, rx) = oneshot::channel();
        let accepted = self.enqueue(service, Pending { request, reply: tx });
        async move {
            accepted?;
            rx.await
                .map_err(|_| RouterError::config("batch dropped before the request ran"))?
        }
    }

    fn enqueue(&self, service: String, pending: Pending<Req, Resp>) -> RouterResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RouterError::config("batch processor is shut down"));
        }
        let mut queues = self.inner.queues.lock().expect("batch queue mutex poisoned");
        let queue = queues.entry(service.clone()).or_default();
        queue.items.push(pending);

        if queue.items.len() >= self.inner.batch_size {
            let batch = Inner::take_queue(queue);
            drop(queues);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run_batch(service, batch).await });
        } else if queue.timer.is_none() {
            let generation = queue.generation;
            let inner = Arc::clone(&self.inner);
            let delay = self.inner.batch_timeout;
            queue.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let batch = inner.take_if_generation(&service, generation);
                inner.run_batch(service, batch).await;
            }));
        }
        Ok(())
    }

    /// Number of requests waiting for `service`.
    pub fn queued(&self, service: &str) -> usize {
        self.inner
            .queues
            .lock()
            .expect("batch queue mutex poisoned")
            .get(service)
            .map_or(0, |q| q.items.len())
    }

    /// Run every queued request now and wait for all of them.
    pub async fn flush_all(&self) {
        let services: Vec<String> = self
            .inner
            .queues
            .lock()
            .expect("batch queue mutex poisoned")
            .keys()
            .cloned()
            .collect();
        let batches = services.into_iter().map(|service| {
            let batch = self.inner.take(&service);
            self.inner.run_batch(service, batch)
        });
        join_all(batches).await;
    }

    /// Refuse new requests and drain what is queued.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_all().await;
        tracing::info!("Batch processor shut down");
    }
}

impl<Req, Resp> fmt::Debug for BatchProcessor<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("batch_size", &self.inner.batch_size)
            .field("batch_timeout", &self.inner.batch_timeout)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> Resource for BatchProcessor<Req, Resp> {
    fn name(&self) -> &str {
        "batch-processor"
    }

    fn release(&self) -> BoxFuture<'_, RouterResult<()>> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn doubler(calls: Arc<AtomicUsize>) -> impl Fn(String, i64) -> BoxFuture<'static, RouterResult<i64>> + Send + Sync {
        move |_service, n| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < 0 {
                    Err(RouterError::config("negative"))
                } else {
                    Ok(n * 2)
                }
            })
        }
    }

    #[tokio::test]
    async fn full_batch_flushes_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batch = BatchProcessor::new(3, Duration::from_secs(3600), doubler(Arc::clone(&calls)));
        let futures: Vec<_> = (1..=3).map(|n| batch.add_request("math", n)).collect();
        assert_eq!(batch.queued("math"), 0);
        let results: Vec<i64> = join_all(futures).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results, vec![2, 4, 6]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_on_timer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batch = BatchProcessor::new(10, Duration::from_millis(100), doubler(Arc::clone(&calls)));
        let pending = batch.add_request("math", 5);
        assert_eq!(batch.queued("math"), 1);
        assert_eq!(pending.await.unwrap(), 10);
        assert_eq!(batch.queued("math"), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_others() {
        let batch = BatchProcessor::new(2, Duration::from_secs(3600), doubler(Arc::new(AtomicUsize::new(0))));
        let bad = batch.add_request("math", -1);
        let good = batch.add_request("math", 4);
        assert!(bad.await.is_err());
        assert_eq!(good.await.unwrap(), 8);
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses() {
        let batch = BatchProcessor::new(10, Duration::from_secs(3600), doubler(Arc::new(AtomicUsize::new(0))));
        let a = batch.add_request("a", 1);
        let b = batch.add_request("b", -2);
        let c = batch.add_request("a", 3);
        Resource::release(&batch).await.unwrap();

        assert_eq!(a.await.unwrap(), 2);
        assert!(b.await.is_err());
        assert_eq!(c.await.unwrap(), 6);
        assert!(batch.add_request("a", 1).await.is_err());
    }
}
