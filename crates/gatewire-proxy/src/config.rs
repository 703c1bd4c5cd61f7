//! Proxy server configuration
//!
//! Tuning values come from environment variables; listener address,
//! backends and worker count from the command line or `GATEWIRE__*`
//! variables.

use anyhow::{Context, Result};
use gatewire_common::config::{
    env_parse_or_default, load_from_env, parse_backend_list, ProxySettings, TelemetrySettings,
};
use gatewire_protocol::BackpressureConfig;
use std::net::SocketAddr;
use tracing::info;

/// Per-connection tuning shared by all workers
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP keepalive time in seconds
    pub tcp_keepalive_secs: u64,
    /// Bytes read from a socket per readiness event
    pub read_buffer_size: usize,
    /// Time allowed for connecting to a backend
    pub backend_connect_timeout_secs: u64,
    /// Client-side write queue limits
    pub client_backpressure: BackpressureConfig,
    /// Backend-side write queue limits
    pub backend_backpressure: BackpressureConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive_secs: env_parse_or_default("GATEWIRE_TCP_KEEPALIVE_SECS", 10),
            read_buffer_size: env_parse_or_default::<usize>("GATEWIRE_READ_BUFFER_SIZE", 16 * 1024)
                .max(1024),
            backend_connect_timeout_secs: env_parse_or_default(
                "GATEWIRE_BACKEND_CONNECT_TIMEOUT_SECS",
                10,
            ),
            client_backpressure: BackpressureConfig::default(),
            backend_backpressure: BackpressureConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Log configuration on startup
    pub fn log_config(&self) {
        info!(
            "Server config: keepalive={}s, read_buffer={}KB, connect_timeout={}s, client_high_water={}KB, client_low_water={}KB",
            self.tcp_keepalive_secs,
            self.read_buffer_size / 1024,
            self.backend_connect_timeout_secs,
            self.client_backpressure.high_water_bytes / 1024,
            self.client_backpressure.low_water_bytes / 1024
        );
    }
}

/// Build proxy settings from CLI values, falling back to `GATEWIRE__*`
/// environment variables for anything not given
pub fn resolve_settings(
    listen: Option<SocketAddr>,
    backends: Option<&str>,
    workers: Option<usize>,
    telemetry: TelemetrySettings,
) -> Result<ProxySettings> {
    let from_env: Option<ProxySettings> = load_from_env("GATEWIRE").ok();

    let listen_addr = match (listen, &from_env) {
        (Some(addr), _) => addr,
        (None, Some(env)) => env.listen_addr,
        (None, None) => "0.0.0.0:4006"
            .parse()
            .context("default listen address")?,
    };

    let backends = match (backends, &from_env) {
        (Some(list), _) => parse_backend_list(list)?,
        (None, Some(env)) => env.backends.clone(),
        (None, None) => anyhow::bail!("no backends configured; use --backends or GATEWIRE__BACKENDS"),
    };

    let workers = workers
        .or_else(|| from_env.as_ref().map(|env| env.workers))
        .unwrap_or_else(default_workers);

    let settings = ProxySettings {
        listen_addr,
        backends,
        workers,
        telemetry,
    };
    settings.validate()?;
    Ok(settings)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_values_win() {
        let settings = resolve_settings(
            Some("127.0.0.1:5000".parse().unwrap()),
            Some("db1:3306,db2:3307"),
            Some(2),
            TelemetrySettings::default(),
        )
        .unwrap();

        assert_eq!(settings.listen_addr.port(), 5000);
        assert_eq!(settings.backends.len(), 2);
        assert_eq!(settings.backends[1].port, 3307);
        assert_eq!(settings.workers, 2);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = resolve_settings(
            Some("127.0.0.1:5000".parse().unwrap()),
            Some("db1:3306"),
            Some(0),
            TelemetrySettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_backend_list_rejected() {
        let result = resolve_settings(
            Some("127.0.0.1:5000".parse().unwrap()),
            Some("db1"),
            Some(1),
            TelemetrySettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert!(config.read_buffer_size >= 1024);
        assert!(config.client_backpressure.low_water_bytes <= config.client_backpressure.high_water_bytes);
    }
}
