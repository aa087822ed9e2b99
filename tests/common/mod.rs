//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use tetra_router::binding::validate::ValidationRule;
use tetra_router::context::Protocol;
use tetra_router::lifecycle::{bootstrap, Routers};
use tetra_router::metadata::{MethodMetadata, ParamMetadata};
use tetra_router::middleware::{MiddlewareDecl, MiddlewareRef};
use tetra_router::rpc::StreamWriter;
use tetra_router::{
    Application, Context, Controller, ControllerClass, ControllerMetadata, Reply, RouterConfig, RouterError,
    RouterResult,
};

/// Records the order in which middleware ran.
pub type Trail = Arc<Mutex<Vec<String>>>;

pub struct Users;

impl Controller for Users {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
        ctx: &'a mut Context,
    ) -> BoxFuture<'a, RouterResult<Reply>> {
        Box::pin(async move {
            match method {
                "list" => Ok(Reply::Value(Value::Array(args))),
                "get" => Ok(json!({ "id": args[0] }).into()),
                "create" => {
                    ctx.set_status(StatusCode::CREATED);
                    Ok(json!({ "created": args[0] }).into())
                }
                "remove" => Ok(Reply::Empty),
                "forbidden" => Ok(RouterError::handler(StatusCode::FORBIDDEN, "not allowed").into()),
                other => Err(RouterError::MethodNotFound {
                    controller: "users".into(),
                    method: other.into(),
                }),
            }
        })
    }
}

pub struct Chat;

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

pub struct Math;

impl Controller for Math {
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: Vec<Value>,
        ctx: &'a mut Context,
    ) -> BoxFuture<'a, RouterResult<Reply>> {
        Box::pin(async move {
            match method {
                "Add" => {
                    let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
                    Ok(json!({ "sum": sum }).into())
                }
                "Count" => {
                    let writer = StreamWriter::from_context(ctx)
                        .ok_or_else(|| RouterError::config("Count needs a streaming call"))?;
                    let upto = args[0].as_u64().unwrap_or(0);
                    for n in 1..=upto {
                        writer.write(json!(n)).await;
                    }
                    Ok(Reply::Empty)
                }
                "Sum" => {
                    let total = args[0]
                        .as_array()
                        .map(|items| items.iter().filter_map(|v| v["n"].as_i64()).sum::<i64>())
                        .unwrap_or(0);
                    Ok(json!({ "total": total }).into())
                }
                "Double" => Ok(json!(args[0].as_i64().unwrap_or(0) * 2).into()),
                "Slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late").into())
                }
                other => Err(RouterError::MethodNotFound {
                    controller: "math".into(),
                    method: other.into(),
                }),
            }
        })
    }
}

fn tracer(trail: &Trail, label: &'static str) -> MiddlewareRef {
    let trail = Arc::clone(trail);
    MiddlewareRef::from_fn(move |ctx: Context, next| {
        let trail = Arc::clone(&trail);
        async move {
            trail.lock().unwrap().push(label.to_string());
            next.run(ctx).await
        }
    })
}

/// Register the fixture controllers on `app`.
pub fn register_controllers(app: &Application, trail: &Trail) {
    let container = app.container();
    container
        .register_controller(ControllerClass::singleton(
            ControllerMetadata::new("users", "/users")
                .middleware(MiddlewareDecl::new("audit", tracer(trail, "audit")).priority(10))
                .middleware(MiddlewareDecl::new("auth", tracer(trail, "auth")).priority(90))
                .route(
                    MethodMetadata::get("list", "/")
                        .param(ParamMetadata::query("page").number().default_value(1))
                        .param(ParamMetadata::query("limit")),
                )
                .route(MethodMetadata::get("get", "/:id").param(ParamMetadata::path("id").number()))
                .route(
                    MethodMetadata::post("create", "/")
                        .param(ParamMetadata::body("name").rule(ValidationRule::Required)),
                )
                .route(MethodMetadata::delete("remove", "/:id"))
                .route(MethodMetadata::get("forbidden", "/secret")),
            Arc::new(Users),
        ))
        .unwrap();
    container
        .register_controller(ControllerClass::singleton(
            ControllerMetadata::new("chat", "/chat")
                .protocol(Protocol::WebSocket)
                .route(
                    MethodMetadata::message("echo", "/message")
                        .param(ParamMetadata::body("text").rule(ValidationRule::Required)),
                ),
            Arc::new(Chat),
        ))
        .unwrap();
    container
        .register_controller(ControllerClass::singleton(
            ControllerMetadata::new("math", "/Math")
                .protocol(Protocol::Grpc)
                .route(
                    MethodMetadata::rpc("Add")
                        .param(ParamMetadata::body("a").number())
                        .param(ParamMetadata::body("b").number()),
                )
                .route(MethodMetadata::rpc("Count").param(ParamMetadata::body("upto").number()))
                .route(MethodMetadata::rpc("Sum").param(ParamMetadata::body("items").whole_source()))
                .route(MethodMetadata::rpc("Double").param(ParamMetadata::body("n").whole_source()))
                .route(MethodMetadata::rpc("Slow")),
            Arc::new(Math),
        ))
        .unwrap();
    container
        .register_controller(ControllerClass::singleton(
            ControllerMetadata::new("users-graph", "")
                .protocol(Protocol::GraphQL)
                .route(
                    MethodMetadata::new("QUERY", "list", "users")
                        .param(ParamMetadata::query("page").number().default_value(1))
                        .param(ParamMetadata::query("limit")),
                ),
            Arc::new(Users),
        ))
        .unwrap();
}

/// A bootstrapped fixture application.
pub fn routers_with(config: RouterConfig) -> (Routers, Trail) {
    let trail: Trail = Arc::default();
    let app = Arc::new(Application::new(config));
    register_controllers(&app, &trail);
    let routers = bootstrap(app).unwrap();
    (routers, trail)
}

pub fn routers() -> (Routers, Trail) {
    routers_with(RouterConfig::default())
}

pub async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
