//! Middleware traits and the continuation chain.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::RouterResult;

/// Future returned by every middleware step.
pub type MiddlewareFuture = BoxFuture<'static, RouterResult<Context>>;

/// Final step of a chain, invoked once every middleware has called `next`.
pub type Terminal = Arc<dyn Fn(Context) -> MiddlewareFuture + Send + Sync>;

/// An interceptor wrapped around route dispatch.
///
/// Implementations receive the request context by value and hand it to
/// `next` to continue the chain; whatever `next` returns flows back out.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, ctx: Context, next: Next) -> MiddlewareFuture;
}

/// Capability interface for middleware types with a `run` entry point.
pub trait Runnable: Send + Sync + 'static {
    fn run(&self, ctx: Context, next: Next) -> MiddlewareFuture;
}

struct FnMiddleware<F>(F);

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RouterResult<Context>> + Send + 'static,
{
    fn call(&self, ctx: Context, next: Next) -> MiddlewareFuture {
        Box::pin((self.0)(ctx, next))
    }
}

struct RunnableMiddleware<R>(R);

impl<R: Runnable> Middleware for RunnableMiddleware<R> {
    fn call(&self, ctx: Context, next: Next) -> MiddlewareFuture {
        self.0.run(ctx, next)
    }
}

/// Shared handle to a middleware callable.
///
/// Clones share identity, which is what route-level resolution uses to
/// match a method-level override against a controller-level declaration.
#[derive(Clone)]
pub struct MiddlewareRef {
    inner: Arc<dyn Middleware>,
}

impl MiddlewareRef {
    /// Wrap a bare async function.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RouterResult<Context>> + Send + 'static,
    {
        Self {
            inner: Arc::new(FnMiddleware(f)),
        }
    }

    /// Wrap a type implementing [`Runnable`].
    pub fn runnable<R: Runnable>(runnable: R) -> Self {
        Self {
            inner: Arc::new(RunnableMiddleware(runnable)),
        }
    }

    pub fn new(middleware: Arc<dyn Middleware>) -> Self {
        Self { inner: middleware }
    }

    /// Identity of the underlying callable.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn same_as(&self, other: &MiddlewareRef) -> bool {
        self.id() == other.id()
    }

    pub(crate) fn as_middleware(&self) -> Arc<dyn Middleware> {
        Arc::clone(&self.inner)
    }
}

impl fmt::Debug for MiddlewareRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MiddlewareRef({:#x})", self.id())
    }
}

/// Continuation handed to each middleware.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    terminal: Terminal,
}

impl Next {
    pub fn new(chain: Arc<[Arc<dyn Middleware>]>, terminal: Terminal) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// A continuation that goes straight to `terminal`.
    pub fn terminal(terminal: Terminal) -> Self {
        Self::new(Arc::from(Vec::new()), terminal)
    }

    /// Continue with the next middleware, or the terminal step when exhausted.
    pub fn run(self, ctx: Context) -> MiddlewareFuture {
        match self.chain.get(self.index) {
            Some(middleware) => {
                let middleware = Arc::clone(middleware);
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                middleware.call(ctx, next)
            }
            None => (self.terminal)(ctx),
        }
    }
}

/// A chain of middleware folded into a single callable.
///
/// Built once per route and cached on the route entry.
#[derive(Clone)]
pub struct ComposedMiddleware {
    chain: Arc<[Arc<dyn Middleware>]>,
    instance_ids: Arc<[String]>,
}

impl ComposedMiddleware {
    pub(crate) fn new(chain: Vec<Arc<dyn Middleware>>, instance_ids: Vec<String>) -> Self {
        Self {
            chain: Arc::from(chain),
            instance_ids: Arc::from(instance_ids),
        }
    }

    /// Run the chain, finishing with `terminal`.
    pub fn run(&self, ctx: Context, terminal: Terminal) -> MiddlewareFuture {
        Next::new(Arc::clone(&self.chain), terminal).run(ctx)
    }

    /// Instance ids in execution order.
    pub fn instance_ids(&self) -> &[String] {
        &self.instance_ids
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

impl Middleware for ComposedMiddleware {
    fn call(&self, ctx: Context, next: Next) -> MiddlewareFuture {
        let terminal: Terminal = Arc::new(move |ctx: Context| next.clone().run(ctx));
        self.run(ctx, terminal)
    }
}

impl fmt::Debug for ComposedMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedMiddleware")
            .field("instance_ids", &self.instance_ids)
            .finish()
    }
}
