//! Multi-protocol request router library.
//!
//! Controllers declare their methods once; the routers expose them over
//! HTTP, WebSocket, RPC and GraphQL with compiled parameter binding and
//! per-route middleware chains.

// Core model
pub mod config;
pub mod context;
pub mod error;
pub mod metadata;

// Request pipeline
pub mod binding;
pub mod di;
pub mod handler;
pub mod middleware;

// Protocols
pub mod http;
pub mod routing;
pub mod rpc;

// Cross-cutting concerns
pub mod app;
pub mod lifecycle;
pub mod observability;

pub use app::{Application, Resource};
pub use config::RouterConfig;
pub use context::{Context, Protocol};
pub use di::{Container, Controller, ControllerClass, Reply};
pub use error::{RouterError, RouterResult, StreamError};
pub use lifecycle::Shutdown;
pub use metadata::{ControllerMetadata, MethodMetadata, ParamMetadata};
pub use routing::RouterRegistry;
