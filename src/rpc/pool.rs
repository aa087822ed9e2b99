//! Outbound connection pooling.
//!
//! # Responsibilities
//! - Keep a bounded free-list of connections per logical service name
//! - Build new connections on demand through a factory
//! - Close connections that do not fit back into the free-list

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use futures_util::future::BoxFuture;

use crate::app::Resource;
use crate::error::{RouterError, RouterResult};

/// An outbound client connection.
pub trait Connection: Send + 'static {
    fn close(&mut self);
}

type Factory<C> = Box<dyn Fn(&str) -> RouterResult<C> + Send + Sync>;

/// Per-service free-lists, each holding at most `pool_size` connections.
pub struct ConnectionPool<C: Connection> {
    pool_size: usize,
    free: Mutex<HashMap<String, Vec<C>>>,
    factory: Factory<C>,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new<F>(pool_size: usize, factory: F) -> Self
    where
        F: Fn(&str) -> RouterResult<C> + Send + Sync + 'static,
    {
        Self {
            pool_size,
            free: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// A pooled connection for `service`, or a fresh one.
    pub fn get(&self, service: &str) -> RouterResult<C> {
        let pooled = self
            .free
            .lock()
            .expect("connection pool mutex poisoned")
            .get_mut(service)
            .and_then(Vec::pop);
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                tracing::debug!(service, "Creating pooled connection");
                (self.factory)(service)
            }
        }
    }

    /// Hand a connection back. Returns `true` if it was kept; a full
    /// free-list closes it instead.
    pub fn release(&self, service: &str, mut conn: C) -> bool {
        let mut free = self.free.lock().expect("connection pool mutex poisoned");
        let list = free.entry(service.to_string()).or_default();
        if list.len() < self.pool_size {
            list.push(conn);
            return true;
        }
        drop(free);
        tracing::debug!(service, pool_size = self.pool_size, "Pool full, closing connection");
        conn.close();
        false
    }

    pub fn idle_count(&self, service: &str) -> usize {
        self.free
            .lock()
            .expect("connection pool mutex poisoned")
            .get(service)
            .map_or(0, Vec::len)
    }

    /// Close and forget every pooled connection. Returns how many were closed.
    pub fn clear(&self) -> usize {
        let drained: Vec<(String, Vec<C>)> = self
            .free
            .lock()
            .expect("connection pool mutex poisoned")
            .drain()
            .collect();
        let mut closed = 0;
        for (service, conns) in drained {
            for mut conn in conns {
                conn.close();
                closed += 1;
            }
            tracing::debug!(service = %service, "Pool drained");
        }
        closed
    }
}

impl<C: Connection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle: usize = self
            .free
            .lock()
            .map(|free| free.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("ConnectionPool")
            .field("pool_size", &self.pool_size)
            .field("idle", &idle)
            .finish()
    }
}

impl<C: Connection> Resource for ConnectionPool<C> {
    fn name(&self) -> &str {
        "connection-pool"
    }

    fn release(&self) -> BoxFuture<'_, RouterResult<()>> {
        Box::pin(async move {
            let closed = self.clear();
            tracing::info!(closed, "Connection pool released");
            Ok::<(), RouterError>(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct MockConn {
        id: usize,
        closed: Arc<AtomicBool>,
    }

    impl Connection for MockConn {
        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn pool(size: usize) -> (ConnectionPool<MockConn>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ConnectionPool::new(size, move |_service| {
            Ok(MockConn {
                id: counter.fetch_add(1, Ordering::SeqCst),
                closed: Arc::new(AtomicBool::new(false)),
            })
        });
        (pool, created)
    }

    #[test]
    fn reuses_released_connections() {
        let (pool, created) = pool(2);
        let conn = pool.get("users").unwrap();
        let id = conn.id;
        assert!(pool.release("users", conn));
        assert_eq!(pool.get("users").unwrap().id, id);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count("orders"), 0);
    }

    #[test]
    fn release_past_capacity_closes_the_connection() {
        let (pool, _) = pool(10);
        let conns: Vec<_> = (0..11).map(|_| pool.get("users").unwrap()).collect();
        let flags: Vec<_> = conns.iter().map(|c| Arc::clone(&c.closed)).collect();

        let kept: Vec<bool> = conns.into_iter().map(|c| pool.release("users", c)).collect();
        assert!(kept[..10].iter().all(|k| *k));
        assert!(!kept[10]);
        assert!(flags[10].load(Ordering::SeqCst));
        assert!(flags[..10].iter().all(|f| !f.load(Ordering::SeqCst)));
        assert_eq!(pool.idle_count("users"), 10);
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let (pool, _) = pool(4);
        let a = pool.get("a").unwrap();
        let b = pool.get("b").unwrap();
        let flags = [Arc::clone(&a.closed), Arc::clone(&b.closed)];
        pool.release("a", a);
        pool.release("b", b);

        Resource::release(&pool).await.unwrap();
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
        assert_eq!(pool.idle_count("a"), 0);
    }
}
