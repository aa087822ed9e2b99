//! Startup orchestration.
//!
//! Order: configuration is loaded and validated by the caller, the
//! application is built and its controllers registered, then
//! [`bootstrap`] installs the four protocol routers and compiles every
//! route. Listeners start last, so traffic only arrives once routing is
//! complete.

use std::io;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::app::Application;
use crate::error::RouterResult;
use crate::lifecycle::shutdown::Shutdown;
use crate::routing::graphql::DEFAULT_GRAPHQL_PATH;
use crate::routing::http::with_layers;
use crate::routing::{GraphqlRouter, HttpRouter, ProtocolRouter, RouterRegistry, RpcRouter, WsRouter};

/// The loaded protocol routers.
#[derive(Debug)]
pub struct Routers {
    pub registry: RouterRegistry,
    pub http: Arc<HttpRouter>,
    pub ws: Arc<WsRouter>,
    pub rpc: Arc<RpcRouter>,
    pub graphql: Arc<GraphqlRouter>,
}

/// Register the protocol routers and load every controller in the
/// application's container. Must run inside a tokio runtime for the
/// condition cache maintenance task to start.
pub fn bootstrap(app: Arc<Application>) -> RouterResult<Routers> {
    app.middleware().start_maintenance();

    let registry = RouterRegistry::new(app);
    let http = Arc::new(HttpRouter::new());
    let ws = Arc::new(WsRouter::default());
    let rpc = Arc::new(RpcRouter::new());
    let graphql = Arc::new(GraphqlRouter::new());
    registry.set_router(http.name(), Arc::clone(&http) as Arc<dyn ProtocolRouter>);
    registry.set_router(ws.name(), Arc::clone(&ws) as Arc<dyn ProtocolRouter>);
    registry.set_router(rpc.name(), Arc::clone(&rpc) as Arc<dyn ProtocolRouter>);
    registry.set_router(graphql.name(), Arc::clone(&graphql) as Arc<dyn ProtocolRouter>);

    let routes = registry.load_registered()?;
    tracing::info!(
        routes,
        routers = ?registry.list_router(),
        middleware = registry.app().middleware().len(),
        "Routing loaded"
    );

    Ok(Routers {
        registry,
        http,
        ws,
        rpc,
        graphql,
    })
}

impl Routers {
    /// HTTP routes, the WebSocket upgrade endpoint and the GraphQL endpoint
    /// in one layered axum router.
    pub fn axum_router(&self) -> RouterResult<Router> {
        let app = self.registry.app();
        let router = self
            .http
            .route_router(app)?
            .merge(self.ws.axum_router())
            .merge(self.graphql.axum_router(DEFAULT_GRAPHQL_PATH));
        Ok(with_layers(router, app))
    }

    /// Serve until `shutdown` fires, then run the registry cleanup.
    pub async fn serve(&self, listener: TcpListener, shutdown: Shutdown) -> io::Result<()> {
        let router = self.axum_router().map_err(io::Error::other)?;
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, ws = self.ws.endpoint(), graphql = DEFAULT_GRAPHQL_PATH, "Server starting");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("Server stopped");
        self.registry.cleanup().await;
        Ok(())
    }
}
