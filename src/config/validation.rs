//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, capacities > 0)
//! - Validate addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RouterConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::RouterConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "server.bind_address",
            format!("'{}' is not a socket address", config.server.bind_address),
        ));
    }
    if config.server.request_timeout_secs == 0 {
        errors.push(ValidationError::new("server.request_timeout_secs", "must be > 0"));
    }

    let mw = &config.middleware;
    for (field, size) in [
        ("middleware.exact_cache_size", mw.exact_cache_size),
        ("middleware.prefix_cache_size", mw.prefix_cache_size),
        ("middleware.pattern_cache_size", mw.pattern_cache_size),
        ("middleware.method_cache_size", mw.method_cache_size),
        ("middleware.header_cache_size", mw.header_cache_size),
    ] {
        if size == 0 {
            errors.push(ValidationError::new(field, "cache capacity must be > 0"));
        }
    }
    if mw.cache_check_interval_secs == 0 {
        errors.push(ValidationError::new(
            "middleware.cache_check_interval_secs",
            "must be > 0",
        ));
    }

    let rpc = &config.rpc;
    if rpc.max_concurrent_streams == 0 {
        errors.push(ValidationError::new("rpc.max_concurrent_streams", "must be > 0"));
    }
    if rpc.stream_timeout_ms == 0 {
        errors.push(ValidationError::new("rpc.stream_timeout_ms", "must be > 0"));
    }
    if rpc.buffer_size == 0 {
        errors.push(ValidationError::new("rpc.buffer_size", "must be > 0"));
    }
    if let Some(cap) = rpc.max_client_stream_bytes {
        if cap < rpc.buffer_size {
            errors.push(ValidationError::new(
                "rpc.max_client_stream_bytes",
                "must be at least rpc.buffer_size",
            ));
        }
    }

    if config.pool.batch_size == 0 {
        errors.push(ValidationError::new("pool.batch_size", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&RouterConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = RouterConfig::default();
        config.server.bind_address = "nowhere".into();
        config.rpc.max_concurrent_streams = 0;
        config.pool.batch_size = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["server.bind_address", "rpc.max_concurrent_streams", "pool.batch_size"]
        );
    }

    #[test]
    fn client_stream_cap_must_fit_a_message() {
        let mut config = RouterConfig::default();
        config.rpc.max_client_stream_bytes = Some(16);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "rpc.max_client_stream_bytes");
    }
}
