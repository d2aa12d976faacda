//! Configuration for hostd.

use std::time::Duration;

use anyhow::Result;

/// Hostd configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP4 port the acceptor listens on.
    pub port: u16,

    /// Default per-call timeout when a request carries no override.
    pub default_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = std::env::var("PODNET_HOSTD_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7717);

        let timeout_secs: u64 = std::env::var("PODNET_HOSTD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let log_level = std::env::var("PODNET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            port,
            default_timeout: Duration::from_secs(timeout_secs),
            log_level,
        })
    }
}
