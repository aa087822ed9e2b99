//! WebSocket adapter.
//!
//! One socket carries many events. Each text frame is a JSON object
//! `{"path": ..., "data": ...}` naming the event; the reply is
//! `{"path", "data"}` on success or `{"path", "error", "status"}` on failure.
//! Binary frames are ignored.

use std::sync::{Arc, OnceLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::Application;
use crate::context::{Context, Protocol};
use crate::di::ControllerClass;
use crate::error::{RouterError, RouterResult};
use crate::handler::dispatch_route;
use crate::routing::builder::{build_routes, prefixed_path};
use crate::routing::entry::RouteEntry;
use crate::routing::registry::{bind_application, ProtocolRouter};
use crate::routing::table::RouteTable;

/// Default upgrade endpoint.
pub const DEFAULT_WS_PATH: &str = "/ws";

#[derive(Debug, Deserialize)]
struct Envelope {
    path: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug)]
pub struct WsRouter {
    endpoint: String,
    table: RouteTable,
    app: OnceLock<Arc<Application>>,
}

impl Default for WsRouter {
    fn default() -> Self {
        Self::new(DEFAULT_WS_PATH)
    }
}

impl WsRouter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            table: RouteTable::new(),
            app: OnceLock::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Answer one text frame.
    pub async fn dispatch_text(&self, text: &str) -> Value {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                return error_frame(Value::Null, &RouterError::Payload(format!("malformed frame: {error}")));
            }
        };
        let path = envelope.path.clone();
        match self.dispatch(envelope).await {
            Ok(data) => json!({ "path": path, "data": data }),
            Err(error) => error_frame(Value::String(path), &error),
        }
    }

    async fn dispatch(&self, envelope: Envelope) -> RouterResult<Value> {
        let app = self
            .app
            .get()
            .ok_or_else(|| RouterError::config("WebSocket router used before load_router"))?;
        let entry = self
            .table
            .get(&envelope.path)
            .ok_or_else(|| RouterError::RouteNotFound(envelope.path.clone()))?;

        let mut ctx = Context::new(Protocol::WebSocket, entry.verb.as_str(), envelope.path.as_str());
        if let Value::Object(fields) = &envelope.data {
            for (key, value) in fields {
                ctx = ctx.with_query(key.clone(), value.clone());
            }
        }
        let ctx = ctx.with_payload(envelope.data);
        let mut ctx = dispatch_route(app, &entry, ctx).await?;
        Ok(ctx.take_body().unwrap_or(Value::Null))
    }

    /// The upgrade route, to merge into the HTTP router.
    pub fn axum_router(self: &Arc<Self>) -> Router {
        let router = Arc::clone(self);
        Router::new().route(
            &self.endpoint,
            get(move |upgrade: WebSocketUpgrade| {
                let router = Arc::clone(&router);
                async move { upgrade.on_upgrade(move |socket| serve_socket(router, socket)).into_response() }
            }),
        )
    }
}

impl ProtocolRouter for WsRouter {
    fn name(&self) -> &str {
        "ws"
    }

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn load_router(&self, app: &Arc<Application>, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize> {
        bind_application(&self.app, app, "ws")?;
        let mut entries = Vec::new();
        for class in controllers {
            entries.extend(build_routes(app, class, prefixed_path)?);
        }
        self.table.insert_all(entries, |entry| entry.path.clone())
    }

    fn routes(&self) -> Vec<Arc<RouteEntry>> {
        self.table.entries()
    }

    fn cleanup(&self) {
        self.table.clear();
    }
}

async fn serve_socket(router: Arc<WsRouter>, mut socket: WebSocket) {
    tracing::debug!(endpoint = %router.endpoint, "WebSocket connected");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                tracing::debug!(%error, "WebSocket receive failed");
                break;
            }
        };
        let reply = router.dispatch_text(text.as_str()).await;
        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
    tracing::debug!(endpoint = %router.endpoint, "WebSocket closed");
}

fn error_frame(path: Value, error: &RouterError) -> Value {
    json!({
        "path": path,
        "error": error.to_string(),
        "status": error.status().as_u16(),
    })
}
