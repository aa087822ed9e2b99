//! RPC adapter.
//!
//! Entries are keyed by `/Service/Method`, the controller prefix naming the
//! service. A transport hands each incoming call to [`RpcRouter::handle_call`];
//! the stream manager supervises it from there.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::app::Application;
use crate::context::{Context, Protocol};
use crate::di::ControllerClass;
use crate::error::{RouterError, RouterResult};
use crate::handler::dispatch_route;
use crate::routing::builder::{build_routes, prefixed_path};
use crate::routing::entry::RouteEntry;
use crate::routing::registry::{bind_application, ProtocolRouter};
use crate::routing::table::RouteTable;
use crate::rpc::{serve_call, CallOutcome, Dispatch, RpcCall};

#[derive(Debug, Default)]
pub struct RpcRouter {
    table: RouteTable,
    app: OnceLock<Arc<Application>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the stream timeout for one `/Service/Method`.
    pub fn set_timeout(&self, path: impl Into<String>, timeout: Duration) -> RouterResult<()> {
        self.app()?.streams().set_path_timeout(path, timeout);
        Ok(())
    }

    fn app(&self) -> RouterResult<&Arc<Application>> {
        self.app
            .get()
            .ok_or_else(|| RouterError::config("RPC router used before load_router"))
    }

    /// Serve one call to completion. Unknown paths are answered with a
    /// not-found error on the call itself.
    pub async fn handle_call(&self, call: RpcCall) -> RouterResult<CallOutcome> {
        let app = Arc::clone(self.app()?);
        let entry = self.table.get(&call.path);
        if entry.is_none() {
            tracing::debug!(path = %call.path, "No RPC route");
        }
        let path = call.path.clone();
        let streams = Arc::clone(app.streams());
        let dispatch: Dispatch = Arc::new(move |ctx: Context| -> BoxFuture<'static, RouterResult<Context>> {
            let app = Arc::clone(&app);
            let entry = entry.clone();
            let path = path.clone();
            Box::pin(async move {
                match entry {
                    Some(entry) => dispatch_route(&app, &entry, ctx).await,
                    None => Err(RouterError::RouteNotFound(path)),
                }
            })
        });
        serve_call(streams, call, dispatch).await
    }
}

impl ProtocolRouter for RpcRouter {
    fn name(&self) -> &str {
        "rpc"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    fn load_router(&self, app: &Arc<Application>, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize> {
        bind_application(&self.app, app, "rpc")?;
        let mut entries = Vec::new();
        for class in controllers {
            entries.extend(build_routes(app, class, prefixed_path)?);
        }
        self.table.insert_all(entries, |entry| entry.path.clone())
    }

    fn routes(&self) -> Vec<Arc<RouteEntry>> {
        self.table.entries()
    }

    /// End every open stream.
    fn cleanup(&self) {
        if let Some(app) = self.app.get() {
            let ended = app.streams().cleanup();
            tracing::debug!(streams = ended, "RPC streams ended");
        }
        self.table.clear();
    }
}
