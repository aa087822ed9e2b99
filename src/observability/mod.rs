//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Routers, middleware manager and stream manager produce:
//!     → logging.rs (subscriber setup: env filter, pretty or JSON lines)
//!     → metrics.rs (dispatch counts, condition cache hits, stream gauges)
//!     → tracing.rs (one `request` span per dispatched route)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape endpoint, when enabled
//! ```

pub mod logging;
pub mod metrics;
pub mod tracing;
