//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the router.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// HTTP/WebSocket listener settings.
    pub server: ServerConfig,

    /// Middleware manager defaults and condition cache sizing.
    pub middleware: MiddlewareSettings,

    /// RPC stream supervision.
    pub rpc: RpcConfig,

    /// Outbound connection pool and batching.
    pub pool: PoolConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Maximum accepted request body size.
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

/// Middleware manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareSettings {
    /// Priority assigned by the manager when none is given (higher runs first).
    pub default_priority: i32,

    /// Priority assigned to route-level declarations when none is given.
    pub route_priority: i32,

    /// Capacity of the exact path match cache.
    pub exact_cache_size: usize,

    /// Capacity of the prefix path match cache.
    pub prefix_cache_size: usize,

    /// Capacity of the compiled pattern cache.
    pub pattern_cache_size: usize,

    /// Capacity of the method normalization cache.
    pub method_cache_size: usize,

    /// Capacity of the header name normalization cache.
    pub header_cache_size: usize,

    /// Interval of the cache pressure check, in seconds.
    pub cache_check_interval_secs: u64,
}

impl Default for MiddlewareSettings {
    fn default() -> Self {
        Self {
            default_priority: 500,
            route_priority: 50,
            exact_cache_size: 1000,
            prefix_cache_size: 500,
            pattern_cache_size: 100,
            method_cache_size: 50,
            header_cache_size: 200,
            cache_check_interval_secs: 300,
        }
    }
}

/// RPC stream configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Maximum number of concurrently active non-unary streams.
    pub max_concurrent_streams: usize,

    /// Stream timeout in milliseconds.
    pub stream_timeout_ms: u64,

    /// Buffered bytes beyond which inbound consumption pauses.
    pub backpressure_threshold: usize,

    /// Largest single message accepted, in bytes.
    pub buffer_size: usize,

    /// Delay before a paused stream resumes, in milliseconds.
    pub resume_delay_ms: u64,

    /// Aggregate cap on a client stream's buffered messages. Unbounded if unset.
    pub max_client_stream_bytes: Option<usize>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            stream_timeout_ms: 300_000,
            backpressure_threshold: 1000,
            buffer_size: 64 * 1024,
            resume_delay_ms: 100,
            max_client_stream_bytes: None,
        }
    }
}

/// Connection pool and batch processor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections retained per service.
    pub pool_size: usize,

    /// Queue length that triggers an immediate flush.
    pub batch_size: usize,

    /// Delay before a partial batch is flushed, in milliseconds.
    pub batch_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            batch_size: 10,
            batch_timeout_ms: 100,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Emit JSON log lines instead of the pretty format.
    pub json_logs: bool,

    /// Expose a Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "tetra_router=info,tower_http=info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RouterConfig::default();
        assert_eq!(config.middleware.default_priority, 500);
        assert_eq!(config.middleware.route_priority, 50);
        assert_eq!(config.rpc.max_concurrent_streams, 100);
        assert_eq!(config.rpc.stream_timeout_ms, 300_000);
        assert_eq!(config.rpc.backpressure_threshold, 1000);
        assert_eq!(config.rpc.buffer_size, 65_536);
        assert_eq!(config.pool.pool_size, 10);
        assert_eq!(config.pool.batch_size, 10);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RouterConfig = toml::from_str(
            r#"
            [rpc]
            max_concurrent_streams = 8

            [pool]
            pool_size = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.rpc.max_concurrent_streams, 8);
        assert_eq!(config.rpc.resume_delay_ms, 100);
        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.pool.batch_timeout_ms, 100);
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
    }
}
