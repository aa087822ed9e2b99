//! tetra-router: serve controllers over HTTP, WebSocket, RPC and GraphQL.
//!
//! ```text
//! Client Request
//!     → axum listener (HTTP, /ws upgrade, /graphql)
//!     → request id, timeout and trace layers
//!     → protocol router (route table lookup)
//!     → middleware chain (priority ordered, conditions cached)
//!     → compiled parameter pipeline
//!     → controller method
//! ```
//!
//! The binary registers a small demo application. Embedders use the
//! library directly and register their own controllers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use tetra_router::binding::validate::ValidationRule;
use tetra_router::config::loader::load_config;
use tetra_router::context::Protocol;
use tetra_router::lifecycle::{bootstrap, shutdown_signal, Shutdown};
use tetra_router::metadata::{MethodMetadata, ParamMetadata};
use tetra_router::middleware::{MiddlewareDecl, MiddlewareRef};
use tetra_router::observability::logging::init_logging;
use tetra_router::observability::metrics::init_metrics;
use tetra_router::{
    Application, Context, Controller, ControllerClass, ControllerMetadata, Reply, RouterConfig, RouterError,
    RouterResult,
};

#[derive(Debug, Parser)]
#[command(name = "tetra-router", version, about = "Multi-protocol request router")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

struct Users;

impl Controller for Users {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
        _ctx: &'a mut Context,
    ) -> BoxFuture<'a, RouterResult<Reply>> {
        Box::pin(async move {
            match method {
                "list" => Ok(json!({ "page": args[0], "limit": args[1], "users": [] }).into()),
                "get" => Ok(json!({ "id": args[0] }).into()),
                other => Err(RouterError::MethodNotFound {
                    controller: "users".into(),
                    method: other.into(),
                }),
            }
        })
    }
}

struct Chat;

impl Controller for Chat {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
        _ctx: &'a mut Context,
    ) -> BoxFuture<'a, RouterResult<Reply>> {
        Box::pin(async move {
            match method {
                "echo" => Ok(json!({ "echo": args[0] }).into()),
                other => Err(RouterError::MethodNotFound {
                    controller: "chat".into(),
                    method: other.into(),
                }),
            }
        })
    }
}

struct Math;

impl Controller for Math {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
        _ctx: &'a mut Context,
    ) -> BoxFuture<'a, RouterResult<Reply>> {
        Box::pin(async move {
            match method {
                "Add" => {
                    let sum = args.iter().filter_map(Value::as_f64).sum::<f64>();
                    Ok(json!({ "sum": sum }).into())
                }
                other => Err(RouterError::MethodNotFound {
                    controller: "math".into(),
                    method: other.into(),
                }),
            }
        })
    }
}

fn register_demo(app: &Application) -> RouterResult<()> {
    let timing = MiddlewareRef::from_fn(|ctx: Context, next| async move {
        let start = std::time::Instant::now();
        let path = ctx.path().to_string();
        let ctx = next.run(ctx).await?;
        tracing::debug!(%path, elapsed_ms = start.elapsed().as_millis() as u64, "Handled");
        Ok::<_, RouterError>(ctx)
    });

    let users = Arc::new(Users) as Arc<dyn Controller>;
    let container = app.container();
    container.register_controller(ControllerClass::singleton(
        ControllerMetadata::new("users", "/users")
            .middleware(MiddlewareDecl::new("timing", timing))
            .route(
                MethodMetadata::get("list", "/")
                    .param(ParamMetadata::query("page").number().default_value(1))
                    .param(ParamMetadata::query("limit").number().default_value(20)),
            )
            .route(MethodMetadata::get("get", "/:id").param(ParamMetadata::path("id").number())),
        Arc::clone(&users),
    ))?;
    container.register_controller(ControllerClass::singleton(
        ControllerMetadata::new("users-graph", "")
            .protocol(Protocol::GraphQL)
            .route(
                MethodMetadata::new("QUERY", "list", "users")
                    .param(ParamMetadata::query("page").number().default_value(1))
                    .param(ParamMetadata::query("limit").number().default_value(20)),
            ),
        users,
    ))?;
    container.register_controller(ControllerClass::singleton(
        ControllerMetadata::new("chat", "/chat")
            .protocol(Protocol::WebSocket)
            .route(
                MethodMetadata::message("echo", "/message")
                    .param(ParamMetadata::body("text").rule(ValidationRule::Required)),
            ),
        Arc::new(Chat),
    ))?;
    container.register_controller(ControllerClass::singleton(
        ControllerMetadata::new("math", "/Math")
            .protocol(Protocol::Grpc)
            .route(
                MethodMetadata::rpc("Add")
                    .param(ParamMetadata::body("a").number())
                    .param(ParamMetadata::body("b").number()),
            ),
        Arc::new(Math),
    ))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => RouterConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tetra-router starting");
    tracing::info!(
        bind_address = %config.server.bind_address,
        request_timeout_secs = config.server.request_timeout_secs,
        max_concurrent_streams = config.rpc.max_concurrent_streams,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let bind_address = config.server.bind_address.clone();
    let app = Arc::new(Application::new(config));
    register_demo(&app)?;
    let routers = bootstrap(app)?;

    let listener = TcpListener::bind(&bind_address).await?;
    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.trigger();
        });
    }

    routers.serve(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
