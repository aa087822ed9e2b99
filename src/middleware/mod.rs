//! Middleware composition and conditional execution.
//!
//! # Data Flow
//! ```text
//! MiddlewareDecl (controller + method)
//!     → resolve.rs (merge, dedupe, order)
//!     → manager.rs register (route-scoped instance ids)
//!     → manager.rs compose → ComposedMiddleware, cached on the route entry
//!     → core.rs Next::run per request, condition.rs guards each step
//! ```

pub mod condition;
pub mod core;
pub mod manager;
pub mod resolve;

pub use condition::{CacheStats, Condition, ConditionCache, ConditionKind, ConditionOperator};
pub use self::core::{ComposedMiddleware, Middleware, MiddlewareFuture, MiddlewareRef, Next, Runnable, Terminal};
pub use manager::{ExecutionContext, MiddlewareConfig, MiddlewareInstance, MiddlewareManager};
pub use resolve::{resolve_route_middleware, MiddlewareDecl};
