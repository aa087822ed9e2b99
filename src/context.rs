//! Per-request context shared by every protocol.
//!
//! A `Context` is built by a protocol adapter, flows by value through the
//! composed middleware chain, and comes back out carrying the response body.

use std::fmt;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Transport protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
    Grpc,
    GraphQL,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "ws",
            Protocol::Grpc => "grpc",
            Protocol::GraphQL => "graphql",
        };
        f.write_str(name)
    }
}

/// Decoded request payload, produced at most once per request.
#[derive(Debug, Clone, Default)]
pub struct ParsedBody {
    /// Decoded body fields.
    pub body: Value,
    /// Uploaded files keyed by field name.
    pub files: Map<String, Value>,
}

impl ParsedBody {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            files: Map::new(),
        }
    }
}

/// Request/response state for one dispatch.
#[derive(Debug)]
pub struct Context {
    protocol: Protocol,
    request_id: String,
    method: String,
    path: String,
    headers: HeaderMap,
    query: Map<String, Value>,
    params: Map<String, Value>,
    raw_body: Bytes,
    parsed: Option<Arc<ParsedBody>>,
    status: StatusCode,
    body: Option<Value>,
    response_headers: HeaderMap,
    extensions: Extensions,
}

impl Context {
    pub fn new(protocol: Protocol, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            protocol,
            request_id: Uuid::new_v4().to_string(),
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            headers: HeaderMap::new(),
            query: Map::new(),
            params: Map::new(),
            raw_body: Bytes::new(),
            parsed: None,
            status: StatusCode::OK,
            body: None,
            response_headers: HeaderMap::new(),
            extensions: Extensions::new(),
        }
    }

    /// Parse a raw query string (`a=1&b=2`). Repeated keys collect into an array.
    pub fn with_query_string(mut self, raw: &str) -> Self {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            insert_multi(&mut self.query, key.into_owned(), Value::String(value.into_owned()));
        }
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Attach an undecoded body; decoded lazily by the payload decoder.
    pub fn with_raw_body(mut self, body: Bytes) -> Self {
        self.raw_body = body;
        self
    }

    /// Attach an already-decoded payload (socket frames, RPC messages).
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.parsed = Some(Arc::new(ParsedBody::new(payload)));
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All request headers as a JSON object with lower-cased names.
    pub fn headers_object(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.headers {
            if let Ok(v) = value.to_str() {
                map.insert(name.as_str().to_string(), Value::String(v.to_string()));
            }
        }
        Value::Object(map)
    }

    pub fn query(&self) -> &Map<String, Value> {
        &self.query
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Query lookup over the merged view: path parameters shadow the query string.
    pub fn query_value(&self, key: &str) -> Option<&Value> {
        self.params.get(key).or_else(|| self.query.get(key))
    }

    /// Merged path and query parameters.
    pub fn merged_query(&self) -> Value {
        let mut merged = self.query.clone();
        for (k, v) in &self.params {
            merged.insert(k.clone(), v.clone());
        }
        Value::Object(merged)
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn parsed_body(&self) -> Option<&Arc<ParsedBody>> {
        self.parsed.as_ref()
    }

    pub(crate) fn set_parsed_body(&mut self, parsed: Arc<ParsedBody>) {
        self.parsed = Some(parsed);
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: Value) {
        self.body = Some(body);
    }

    pub fn take_body(&mut self) -> Option<Value> {
        self.body.take()
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn set_response_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.response_headers.insert(name, value);
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

pub(crate) fn insert_multi(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}
