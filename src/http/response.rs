//! Turning dispatch results into HTTP responses.
//!
//! Bodies are JSON. A context without a body answers `204 No Content`
//! unless a handler chose another status. Errors become
//! `{"error": ..., "status": ...}` with the error's own status code, plus
//! `"param"` for binding failures.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::context::Context;
use crate::error::RouterError;
use crate::http::request::X_REQUEST_ID;

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }
        let mut body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        if let Some(index) = self.param_index() {
            body["param"] = json!(index);
        }
        (status, Json(body)).into_response()
    }
}

/// Build the response for a successfully dispatched context.
pub fn context_into_response(mut ctx: Context) -> Response {
    let status = ctx.status();
    let mut response = match ctx.take_body() {
        Some(body) => (status, Json(body)).into_response(),
        None if status == StatusCode::OK => StatusCode::NO_CONTENT.into_response(),
        None => status.into_response(),
    };
    let headers = response.headers_mut();
    for (name, value) in ctx.response_headers() {
        headers.insert(name.clone(), value.clone());
    }
    if let Ok(id) = HeaderValue::from_str(ctx.request_id()) {
        headers.insert(X_REQUEST_ID, id);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Protocol;
    use serde_json::Value;

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn binding_errors_name_the_parameter() {
        let response = RouterError::binding(1, "expected a number").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["param"], json!(1));
        assert_eq!(body["status"], json!(400));
    }

    #[tokio::test]
    async fn context_headers_and_body_are_copied() {
        let mut ctx = Context::new(Protocol::Http, "GET", "/").with_request_id("req-1");
        ctx.set_body(json!({"ok": true}));
        ctx.set_status(StatusCode::CREATED);
        ctx.set_response_header("x-custom", "1");

        let response = context_into_response(ctx);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-custom").unwrap(), "1");
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(json_body(response).await, json!({"ok": true}));
    }

    #[test]
    fn empty_body_is_no_content() {
        let ctx = Context::new(Protocol::Http, "DELETE", "/users/1");
        assert_eq!(context_into_response(ctx).status(), StatusCode::NO_CONTENT);
    }
}
