//! GraphQL adapter.
//!
//! Each controller method answers one root field of the query or mutation
//! type. Only the first root field of the operation is executed; its
//! arguments and the request variables are bound as both query and body
//! values, so `ParamMetadata::query` and `ParamMetadata::body` both work.

use std::sync::{Arc, OnceLock};

use axum::routing::post;
use axum::{Json, Router};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::app::Application;
use crate::context::{Context, Protocol};
use crate::di::ControllerClass;
use crate::error::{RouterError, RouterResult};
use crate::handler::dispatch_route;
use crate::routing::builder::build_routes;
use crate::routing::entry::RouteEntry;
use crate::routing::registry::{bind_application, ProtocolRouter};
use crate::routing::table::RouteTable;

/// Default HTTP endpoint.
pub const DEFAULT_GRAPHQL_PATH: &str = "/graphql";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

impl GraphqlRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }
}

/// The root selection of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RootField {
    /// `QUERY` or `MUTATION`.
    pub operation: &'static str,
    pub field: String,
    /// Key of the field in the response: its alias, or the field name.
    pub response_key: String,
    pub arguments: Map<String, Value>,
}

fn root_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*(?:(query|mutation)\b\s*(?:[A-Za-z_][A-Za-z0-9_]*)?\s*(?:\([^)]*\))?\s*)?\{\s*(?:([A-Za-z_][A-Za-z0-9_]*)\s*:\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*(?:\(([^)]*)\))?",
        )
        .expect("root field pattern is valid")
    })
}

/// Find the first root field of `query`, resolving `$variables` in its
/// arguments.
pub fn parse_root_field(query: &str, variables: &Map<String, Value>) -> RouterResult<RootField> {
    let captures = root_pattern()
        .captures(query)
        .ok_or_else(|| RouterError::Payload("no root field in GraphQL document".into()))?;
    let operation = match captures.get(1).map(|m| m.as_str()) {
        Some("mutation") => "MUTATION",
        _ => "QUERY",
    };
    let field = captures[3].to_string();
    let response_key = captures
        .get(2)
        .map_or_else(|| field.clone(), |alias| alias.as_str().to_string());
    let arguments = match captures.get(4) {
        Some(raw) => parse_arguments(raw.as_str(), variables)?,
        None => Map::new(),
    };
    Ok(RootField {
        operation,
        field,
        response_key,
        arguments,
    })
}

/// Scalar arguments only: strings, numbers, booleans, null and variables.
fn parse_arguments(raw: &str, variables: &Map<String, Value>) -> RouterResult<Map<String, Value>> {
    let mut arguments = Map::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once(':')
            .ok_or_else(|| RouterError::Payload(format!("malformed argument '{pair}'")))?;
        let value = value.trim();
        let value = if let Some(variable) = value.strip_prefix('$') {
            variables.get(variable).cloned().unwrap_or(Value::Null)
        } else {
            serde_json::from_str(value)
                .map_err(|_| RouterError::Payload(format!("unsupported argument value '{value}'")))?
        };
        arguments.insert(name.trim().to_string(), value);
    }
    Ok(arguments)
}

#[derive(Debug, Default)]
pub struct GraphqlRouter {
    table: RouteTable,
    app: OnceLock<Arc<Application>>,
}

impl GraphqlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one request, always producing a GraphQL response document.
    pub async fn execute(&self, request: GraphqlRequest) -> Value {
        let variables = request.variables.unwrap_or_default();
        let root = match parse_root_field(&request.query, &variables) {
            Ok(root) => root,
            Err(error) => return error_document(&error),
        };
        match self.resolve(&root, variables).await {
            Ok(value) => json!({ "data": { root.response_key: value } }),
            Err(error) => error_document(&error),
        }
    }

    async fn resolve(&self, root: &RootField, variables: Map<String, Value>) -> RouterResult<Value> {
        let app = self
            .app
            .get()
            .ok_or_else(|| RouterError::config("GraphQL router used before load_router"))?;
        let entry = self
            .table
            .get(&root.field)
            .filter(|entry| entry.verb == root.operation)
            .ok_or_else(|| RouterError::RouteNotFound(format!("{} {}", root.operation, root.field)))?;

        let mut inputs = variables;
        inputs.extend(root.arguments.clone());
        let mut ctx = Context::new(Protocol::GraphQL, root.operation, root.field.as_str());
        for (key, value) in &inputs {
            ctx = ctx.with_query(key.clone(), value.clone());
        }
        let ctx = ctx.with_payload(Value::Object(inputs));
        let mut ctx = dispatch_route(app, &entry, ctx).await?;
        Ok(ctx.take_body().unwrap_or(Value::Null))
    }

    /// `POST` endpoint accepting `{"query", "variables", "operationName"}`.
    pub fn axum_router(self: &Arc<Self>, path: &str) -> Router {
        let router = Arc::clone(self);
        Router::new().route(
            path,
            post(move |Json(request): Json<GraphqlRequest>| {
                let router = Arc::clone(&router);
                async move { Json(router.execute(request).await) }
            }),
        )
    }
}

impl ProtocolRouter for GraphqlRouter {
    fn name(&self) -> &str {
        "graphql"
    }

    fn protocol(&self) -> Protocol {
        Protocol::GraphQL
    }

    fn load_router(&self, app: &Arc<Application>, controllers: &[Arc<ControllerClass>]) -> RouterResult<usize> {
        bind_application(&self.app, app, "graphql")?;
        let mut entries = Vec::new();
        for class in controllers {
            entries.extend(build_routes(app, class, |_, method| method.path.clone())?);
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

fn error_document(error: &RouterError) -> Value {
    json!({
        "data": null,
        "errors": [{
            "message": error.to_string(),
            "extensions": { "status": error.status().as_u16() },
        }],
    })
}
