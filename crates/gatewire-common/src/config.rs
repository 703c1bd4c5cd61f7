//! Configuration utilities for gatewire services

use crate::error::{GatewireError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Address of one backend database server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendAddress {
    pub host: String,
    pub port: u16,
}

impl BackendAddress {
    /// Human-readable name used in logs
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BackendAddress {
    type Err = GatewireError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            GatewireError::ConfigError(format!("backend address '{}' is missing a port", s))
        })?;
        if host.is_empty() {
            return Err(GatewireError::ConfigError(format!(
                "backend address '{}' is missing a host",
                s
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            GatewireError::ConfigError(format!("backend address '{}' has an invalid port", s))
        })?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}

impl TryFrom<String> for BackendAddress {
    type Error = GatewireError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BackendAddress> for String {
    fn from(addr: BackendAddress) -> Self {
        addr.to_string()
    }
}

/// Parse a comma separated backend list such as `db1:3306,db2:3306`
pub fn parse_backend_list(list: &str) -> Result<Vec<BackendAddress>> {
    let backends = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<_>>>()?;

    if backends.is_empty() {
        return Err(GatewireError::ConfigError(
            "at least one backend address is required".into(),
        ));
    }
    Ok(backends)
}

/// Proxy listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Address the client-facing listener binds to
    pub listen_addr: SocketAddr,
    /// Backend servers, tried in round-robin order
    pub backends: Vec<BackendAddress>,
    /// Number of worker threads (each runs its own reactor)
    pub workers: usize,
    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl ProxySettings {
    /// Reject settings the proxy cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(GatewireError::ConfigError(
                "at least one backend address is required".into(),
            ));
        }
        if self.workers == 0 {
            return Err(GatewireError::ConfigError(
                "worker count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Telemetry/observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
    /// Optional file to write logs to instead of stdout
    pub log_file: Option<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
            log_file: None,
        }
    }
}

/// Load configuration from environment variables
pub fn load_from_env<T: for<'de> Deserialize<'de>>(prefix: &str) -> Result<T> {
    Ok(config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("backends")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?)
}

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
