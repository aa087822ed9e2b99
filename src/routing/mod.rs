//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route Compilation (at startup):
//!     ControllerClass[] (from the container)
//!     → registry.rs (hand each controller to the router of its protocol)
//!     → builder.rs (resolve + register + compose middleware, compile params)
//!     → table.rs (freeze entries, swapped in atomically)
//!
//! Incoming request:
//!     http.rs / ws.rs / rpc.rs / graphql.rs (transport → Context)
//!     → table lookup → handler::dispatch_route
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Middleware chains composed once per route, never per request
//! - Protocol adapters format errors; the handler only propagates them

pub mod builder;
pub mod entry;
pub mod graphql;
pub mod http;
pub mod registry;
pub mod rpc;
pub mod table;
pub mod ws;

pub use builder::build_routes;
pub use entry::RouteEntry;
pub use graphql::{GraphqlRequest, GraphqlRouter};
pub use http::HttpRouter;
pub use registry::{ProtocolRouter, RouterRegistry};
pub use rpc::RpcRouter;
pub use table::RouteTable;
pub use ws::WsRouter;
