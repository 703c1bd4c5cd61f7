//! Gatewire
//!
//! Entry point for the proxy and the container file tools:
//! - `serve`: relay MySQL client sessions to a pool of backend servers
//! - `dump`: print the records (or raw blocks) of a container file
//! - `schema`: print a container file's header

mod config;
mod connection;
mod dump;
mod errors;
mod pool;
mod server;
mod telemetry;

use crate::config::{resolve_settings, ServerConfig};
use crate::server::ProxyServer;
use anyhow::Context;
use clap::{Parser, Subcommand};
use gatewire_common::metrics;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gatewire")]
#[command(about = "Gatewire - MySQL protocol proxy and container file tools")]
struct Args {
    /// Log level
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "GATEWIRE_LOG_FILE")]
    log_file: Option<String>,

    /// Log as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy
    Serve {
        /// Address to accept client connections on
        #[arg(long, env = "GATEWIRE_LISTEN")]
        listen: Option<SocketAddr>,

        /// Comma-separated backend servers, host:port
        #[arg(long, env = "GATEWIRE_BACKENDS")]
        backends: Option<String>,

        /// Worker threads; defaults to the number of CPUs
        #[arg(long, env = "GATEWIRE_WORKERS")]
        workers: Option<usize>,
    },

    /// Print the records of a container file as JSON lines
    Dump {
        file: PathBuf,

        /// Index of the first record to print
        #[arg(long)]
        offset: Option<u64>,

        /// Print encoded blocks instead of records
        #[arg(long, conflicts_with = "offset")]
        raw: bool,
    },

    /// Print the header of a container file
    Schema { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let telemetry_settings =
        telemetry::settings_from_args(&args.log_level, args.log_file.as_deref(), args.json_logs);
    let log_file = match &telemetry_settings.log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path))?,
        ),
        None => None,
    };
    telemetry::init(&telemetry_settings, log_file)?;

    match args.command {
        Command::Serve {
            listen,
            backends,
            workers,
        } => {
            let settings = resolve_settings(listen, backends.as_deref(), workers, telemetry_settings)?;
            info!("Starting Gatewire proxy");
            info!("  Listen address: {}", settings.listen_addr);
            info!("  Workers: {}", settings.workers);
            for backend in &settings.backends {
                info!("  Backend: {}", backend);
            }

            let config = ServerConfig::default();
            config.log_config();

            let server = ProxyServer::new(&settings, config);
            server
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await?;

            let context = server.context();
            for backend in context.pool.iter() {
                info!(
                    backend = %backend.address,
                    healthy = backend.is_healthy(),
                    connections = backend.connections(),
                    failures = backend.failures(),
                    "Backend summary"
                );
            }
            info!("Final metrics:\n{}", metrics::gather_text());
            info!("Gatewire proxy stopped");
        }

        Command::Dump { file, offset, raw } => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            if raw {
                let blocks = dump::dump_raw_blocks(&file, &mut out)?;
                info!("Dumped {} blocks from {}", blocks, file.display());
            } else {
                let records = dump::dump_records(&file, offset, &mut out)?;
                info!("Dumped {} records from {}", records, file.display());
            }
        }

        Command::Schema { file } => {
            let stdout = std::io::stdout();
            dump::print_schema(&file, &mut stdout.lock())?;
        }
    }

    Ok(())
}
