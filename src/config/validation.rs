//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pool size > 0)
//! - Check addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{GatewayConfig, PLACEHOLDER_API_KEY};
use crate::fastcgi::BackendAddr;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);

    let fcgi = &config.fastcgi;
    if fcgi.pass.is_empty() {
        errors.push(ValidationError::new("fastcgi.pass", "empty fastcgi pass"));
    } else if let Err(e) = fcgi.pass.parse::<BackendAddr>() {
        errors.push(ValidationError::new("fastcgi.pass", e.to_string()));
    }
    if fcgi.root.as_os_str().is_empty() {
        errors.push(ValidationError::new("fastcgi.root", "empty fastcgi root"));
    }
    if fcgi.pool_size == 0 {
        errors.push(ValidationError::new("fastcgi.pool_size", "must be at least 1"));
    }
    if fcgi.split_path.iter().any(String::is_empty) {
        errors.push(ValidationError::new("fastcgi.split_path", "markers must not be empty"));
    }
    for (field, value) in [
        ("fastcgi.dial_timeout_ms", fcgi.dial_timeout_ms),
        ("fastcgi.call_timeout_secs", fcgi.call_timeout_secs),
        ("fastcgi.idle_timeout_secs", fcgi.idle_timeout_secs),
        ("fastcgi.watchdog_interval_ms", fcgi.watchdog_interval_ms),
        ("fastcgi.acquire_timeout_ms", fcgi.acquire_timeout_ms),
        ("timeouts.request_secs", config.timeouts.request_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.security.max_body_size == 0 {
        errors.push(ValidationError::new("security.max_body_size", "must be greater than zero"));
    }

    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.enabled {
        check_socket_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() || config.admin.api_key == PLACEHOLDER_API_KEY {
            errors.push(ValidationError::new(
                "admin.api_key",
                "set a real API key before enabling the admin API",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("invalid socket address {value:?}")));
    }
}
