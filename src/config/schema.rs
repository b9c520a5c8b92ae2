//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fastcgi::{BackendAddr, ClientOptions, FcgiResult, PoolOptions, TransportConfig};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// FastCGI backend and CGI environment settings.
    pub fastcgi: FastcgiConfig,

    /// Front-end timeouts.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    pub admin: AdminConfig,

    pub security: SecurityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// FastCGI backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FastcgiConfig {
    /// Backend as "<network>:<address>", e.g. "unix:/run/php/php-fpm.sock"
    /// or "tcp:127.0.0.1:9000".
    pub pass: String,

    /// Document root.
    pub root: PathBuf,

    /// Markers splitting SCRIPT_NAME from PATH_INFO.
    pub split_path: Vec<String>,

    /// Extra CGI variables for every request.
    pub env: HashMap<String, String>,

    /// Canonicalize the root per request.
    pub resolve_root_symlink: bool,

    /// Number of clients in the pool.
    pub pool_size: usize,

    /// Reuse backend connections between requests.
    pub keep_alive: bool,

    pub dial_timeout_ms: u64,

    /// Deadline for one FastCGI call, enforced by the connection watchdog.
    pub call_timeout_secs: u64,

    /// Idle connections older than this are closed.
    pub idle_timeout_secs: u64,

    pub watchdog_interval_ms: u64,

    /// Longest wait for a free pooled client.
    pub acquire_timeout_ms: u64,

    /// Value of SERVER_SOFTWARE.
    pub server_software: String,
}

impl Default for FastcgiConfig {
    fn default() -> Self {
        Self {
            pass: "unix:/run/php/php-fpm.sock".to_string(),
            root: PathBuf::from("/var/www/html"),
            split_path: vec![".php".to_string()],
            env: HashMap::new(),
            resolve_root_symlink: false,
            pool_size: 5,
            keep_alive: true,
            dial_timeout_ms: 3000,
            call_timeout_secs: 5,
            idle_timeout_secs: 86_400,
            watchdog_interval_ms: 1000,
            acquire_timeout_ms: 5000,
            server_software: format!("fcgi-gateway/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FastcgiConfig {
    pub fn backend(&self) -> FcgiResult<BackendAddr> {
        self.pass.parse()
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            client: ClientOptions {
                keep_alive: self.keep_alive,
                dial_timeout: Duration::from_millis(self.dial_timeout_ms),
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
            },
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }

    pub fn transport_config(&self, max_body_size: usize) -> TransportConfig {
        TransportConfig {
            root: self.root.clone(),
            split_path: self.split_path.clone(),
            resolve_root_symlink: self.resolve_root_symlink,
            env: self.env.clone(),
            server_software: self.server_software.clone(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_body_size,
        }
    }
}

/// Timeout configuration for the HTTP front end.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Placeholder admin key; validation refuses it when the admin API is on.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_API_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Request hardening.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}
