//! RPC subsystem.
//!
//! # Data Flow
//! ```text
//! transport call
//!     → call.rs (RpcCall → classified RpcStream)
//!     → stream.rs (registration, concurrency gate, backpressure accounting)
//!     → handle.rs (per-shape supervision under one deadline)
//!     → routed controller method via the request handler
//! ```
//!
//! Outbound side: `pool.rs` keeps per-service client connections and
//! `batch.rs` coalesces outbound requests.

pub mod batch;
pub mod call;
pub mod handle;
pub mod pool;
pub mod stream;

pub use batch::BatchProcessor;
pub use call::{CallHead, Frame, RpcCall, RpcStream, StreamWriter};
pub use handle::{serve_call, CallOutcome, Dispatch};
pub use pool::{Connection, ConnectionPool};
pub use stream::{classify, StreamKind, StreamManager, StreamState};
