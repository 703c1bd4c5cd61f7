//! Logging setup
//!
//! The log file, when there is one, is opened by `main` and handed in here;
//! telemetry never creates writers on its own.

use anyhow::Result;
use gatewire_common::config::TelemetrySettings;
use std::fs::File;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber
pub fn init(settings: &TelemetrySettings, log_file: Option<File>) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match (settings.json_logs, log_file) {
        (true, Some(file)) => subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .try_init()?,
        (true, None) => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        (false, Some(file)) => subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .try_init()?,
        (false, None) => subscriber.with(tracing_subscriber::fmt::layer()).try_init()?,
    }

    Ok(())
}

/// Settings from the CLI, falling back to `JSON_LOGS` for the format
pub fn settings_from_args(log_level: &str, log_file: Option<&str>, json_logs: bool) -> TelemetrySettings {
    let json_env = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    TelemetrySettings {
        log_level: log_level.to_string(),
        json_logs: json_logs || json_env,
        log_file: log_file.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_args() {
        let settings = settings_from_args("debug", Some("/tmp/gatewire.log"), true);
        assert_eq!(settings.log_level, "debug");
        assert!(settings.json_logs);
        assert_eq!(settings.log_file.as_deref(), Some("/tmp/gatewire.log"));
    }
}
