//! Router error types.
//!
//! Every failure surfaced by the core maps onto an HTTP-equivalent status so
//! protocol adapters can format it without knowing where it came from.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors produced while handling an RPC stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("server busy: {active} active streams (limit {limit})")]
    ServerBusy { active: usize, limit: usize },

    #[error("stream {0} timed out")]
    Timeout(u64),

    #[error("stream {0} cancelled by peer")]
    Cancelled(u64),

    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("stream {id} failed: {message}")]
    Failed { id: u64, message: String },

    #[error("stream manager is shut down")]
    Closed,
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::ServerBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // 499 is the de-facto "client closed request" status.
            StreamError::Cancelled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            StreamError::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            StreamError::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Errors raised anywhere along the dispatch path.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Missing, malformed or invalid parameter. Never retried.
    #[error("invalid parameter at index {index}: {message}")]
    Binding { index: usize, message: String },

    #[error("controller not found: {0}")]
    ControllerNotFound(String),

    #[error("method {method} not found on controller {controller}")]
    MethodNotFound { controller: String, method: String },

    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Invalid setup; raised synchronously while wiring routes.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("payload error: {0}")]
    Payload(String),

    /// Error reported by a controller method, either returned or raised.
    #[error("{message}")]
    Handler { status: StatusCode, message: String },
}

impl RouterError {
    pub fn binding(index: usize, message: impl Into<String>) -> Self {
        RouterError::Binding {
            index,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RouterError::Config(message.into())
    }

    pub fn handler(status: StatusCode, message: impl Into<String>) -> Self {
        RouterError::Handler {
            status,
            message: message.into(),
        }
    }

    /// HTTP-equivalent status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            RouterError::Binding { .. } | RouterError::Payload(_) => StatusCode::BAD_REQUEST,
            RouterError::ControllerNotFound(_)
            | RouterError::MethodNotFound { .. }
            | RouterError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            RouterError::Stream(e) => e.status(),
            RouterError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RouterError::Handler { status, .. } => *status,
        }
    }

    /// Index of the offending parameter for binding failures.
    pub fn param_index(&self) -> Option<usize> {
        match self {
            RouterError::Binding { index, .. } => Some(*index),
            _ => None,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
