//! HTTP protocol plumbing shared by the routers.
//!
//! # Data Flow
//! ```text
//! axum request
//!     → request.rs (request id assigned or propagated)
//!     → routing::http (Context built, route dispatched)
//!     → response.rs (Context or RouterError → Response)
//! ```

pub mod request;
pub mod response;

pub use request::{RequestId, RequestIdExt, RequestIdLayer, X_REQUEST_ID};
pub use response::context_into_response;
