//! HTTP adapter.
//!
//! Route entries become one axum route per path, each verb dispatching to
//! its entry. Path patterns accept both `:param` and `{param}` segments, and
//! a trailing `*rest` or `{*rest}` wildcard.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use serde_json::{Map, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::app::Application;
use crate::context::{Context, Protocol};
use crate::di::ControllerClass;
use crate::error::{RouterError, RouterResult};
use crate::handler::dispatch_route;
use crate::http::request::{RequestIdExt, RequestIdLayer};
use crate::http::response::context_into_response;
use crate::routing::builder::{build_routes, prefixed_path};
use crate::routing::entry::RouteEntry;
use crate::routing::registry::{bind_application, ProtocolRouter};
use crate::routing::table::RouteTable;

#[derive(Debug, Default)]
pub struct HttpRouter {
    table: RouteTable,
    app: OnceLock<Arc<Application>>,
}

impl HttpRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the axum router serving every loaded entry, with the request
    /// id, tracing and timeout layers applied. Fails before the first load.
    pub fn axum_router(&self) -> RouterResult<Router> {
        let app = self
            .app
            .get()
            .ok_or_else(|| RouterError::config("HTTP router used before load_router"))?;
        Ok(with_layers(self.route_router(app)?, app))
    }

    /// One axum route per path, without layers, so other adapters' routes
    /// can be merged in before [`with_layers`] wraps the whole thing.
    pub fn route_router(&self, app: &Arc<Application>) -> RouterResult<Router> {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
        for entry in self.table.entries() {
            let filter = method_filter(&entry.verb)?;
            let handler_app = Arc::clone(app);
            let handler_entry = Arc::clone(&entry);
            let handler = move |request: Request<Body>| {
                let app = Arc::clone(&handler_app);
                let entry = Arc::clone(&handler_entry);
                async move { serve(app, entry, request).await }
            };
            let path = axum_path(&entry.path);
            let method_router = match by_path.remove(&path) {
                Some(existing) => existing.on(filter, handler),
                None => on(filter, handler),
            };
            by_path.insert(path, method_router);
        }

        Ok(by_path
            .into_iter()
            .fold(Router::new(), |router, (path, methods)| router.route(&path, methods))
            .fallback(not_found))
    }
}

/// Wrap `router` in the request-id, tracing and timeout layers.
#[allow(deprecated)]
pub fn with_layers(router: Router, app: &Application) -> Router {
    router
        .layer(TimeoutLayer::new(app.request_timeout()))
        .layer(RequestIdLayer)
        .layer(TraceLayer::new_for_http())
}

impl ProtocolRouter for HttpRouter {
    fn name(&self) -> &str {
        "http"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn load_router(&self, app: &Arc<Application>, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize> {
        bind_application(&self.app, app, "http")?;
        let mut entries = Vec::new();
        for class in controllers {
            entries.extend(build_routes(app, class, prefixed_path)?);
        }
        self.table.insert_all(entries, RouteEntry::key)
    }

    fn routes(&self) -> Vec<Arc<RouteEntry>> {
        self.table.entries()
    }

    fn cleanup(&self) {
        self.table.clear();
    }
}

async fn serve(app: Arc<Application>, entry: Arc<RouteEntry>, request: Request<Body>) -> Response {
    let request_id = request.request_id().map(str::to_string);
    let (parts, body) = request.into_parts();
    let raw = match axum::body::to_bytes(body, app.body_options().limit).await {
        Ok(raw) => raw,
        Err(error) => return RouterError::Payload(format!("failed to read body: {error}")).into_response(),
    };

    let path = parts.uri.path().to_string();
    let mut ctx = Context::new(Protocol::Http, parts.method.as_str(), path.as_str())
        .with_query_string(parts.uri.query().unwrap_or_default())
        .with_headers(parts.headers)
        .with_raw_body(raw);
    if let Some(id) = request_id {
        ctx = ctx.with_request_id(id);
    }
    for (key, value) in path_params(&entry.path, &path) {
        ctx = ctx.with_param(key, value);
    }

    match dispatch_route(&app, &entry, ctx).await {
        Ok(ctx) => context_into_response(ctx),
        Err(error) => error.into_response(),
    }
}

async fn not_found(request: Request<Body>) -> Response {
    RouterError::RouteNotFound(format!("{} {}", request.method(), request.uri().path())).into_response()
}

fn method_filter(verb: &str) -> RouterResult<MethodFilter> {
    if verb == "ALL" || verb == "ANY" {
        return Ok(MethodFilter::GET
            .or(MethodFilter::POST)
            .or(MethodFilter::PUT)
            .or(MethodFilter::PATCH)
            .or(MethodFilter::DELETE)
            .or(MethodFilter::HEAD)
            .or(MethodFilter::OPTIONS));
    }
    let method = Method::from_bytes(verb.as_bytes())
        .map_err(|_| RouterError::config(format!("invalid HTTP verb {verb}")))?;
    MethodFilter::try_from(method).map_err(|error| RouterError::config(format!("unsupported HTTP verb {verb}: {error}")))
}

/// Rewrite `:param` and `*rest` segments into axum's `{param}` form.
pub fn axum_path(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect();
    segments.join("/")
}

/// Capture the values of `pattern`'s parameter segments from `path`.
pub fn path_params(pattern: &str, path: &str) -> Map<String, Value> {
    let mut params = Map::new();
    let mut actual = path.split('/').filter(|s| !s.is_empty());
    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        let name = segment
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .or_else(|| segment.strip_prefix(':'))
            .or_else(|| segment.strip_prefix('*'));
        match name {
            Some(name) if name.starts_with('*') || segment.starts_with('*') => {
                let rest: Vec<&str> = actual.by_ref().collect();
                params.insert(name.trim_start_matches('*').to_string(), Value::String(decode(&rest.join("/"))));
                break;
            }
            Some(name) => match actual.next() {
                Some(value) => {
                    params.insert(name.to_string(), Value::String(decode(value)));
                }
                None => break,
            },
            None => {
                if actual.next().is_none() {
                    break;
                }
            }
        }
    }
    params
}

fn decode(raw: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", raw.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_colon_params() {
        assert_eq!(axum_path("/users/:id/posts/{post}"), "/users/{id}/posts/{post}");
        assert_eq!(axum_path("/files/*rest"), "/files/{*rest}");
        assert_eq!(axum_path("/"), "/");
    }

    #[test]
    fn captures_path_values() {
        let params = path_params("/users/:id/posts/{post}", "/users/7/posts/hello%20world");
        assert_eq!(params.get("id"), Some(&json!("7")));
        assert_eq!(params.get("post"), Some(&json!("hello world")));

        let params = path_params("/files/{*rest}", "/files/a/b+c.txt");
        assert_eq!(params.get("rest"), Some(&json!("a/b+c.txt")));
    }

    #[test]
    fn unknown_verbs_are_config_errors() {
        assert!(method_filter("GET").is_ok());
        assert!(method_filter("ALL").is_ok());
        assert!(matches!(method_filter("MESSAGE"), Err(RouterError::Config(_))));
    }

    #[test]
    fn router_needs_a_load_first() {
        assert!(HttpRouter::new().axum_router().is_err());
    }
}
