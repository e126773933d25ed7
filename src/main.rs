//! Amanuensis proxy binary.
//!
//! Loads configuration, starts the proxy, logs traffic summaries and
//! shuts down on Ctrl-C.

use std::path::PathBuf;

use clap::Parser;

use amanuensis::config::{load_config, validation::validate_config, ConfigError, ProxyConfig};
use amanuensis::observability::{init_logging, metrics, spawn_event_logger};
use amanuensis::{ProxyServer, ProxyService};

#[derive(Parser, Debug)]
#[command(name = "amanuensis")]
#[command(about = "Local forward HTTP proxy for inspecting traffic", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level, overriding the configuration.
    #[arg(long)]
    log_level: Option<String>,
}

fn resolve_config(cli: &Cli) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(port) = cli.port {
        config.listener.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }

    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "amanuensis starting");
    tracing::info!(
        bind_address = %config.listener.bind_address(),
        max_connections = config.listener.max_connections,
        connect_timeout_secs = config.timeouts.connect_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = ProxyServer::new(config);
    let logger = spawn_event_logger(server.events());
    let address = server.listen().await?;
    tracing::info!(address = %address, "Point your HTTP proxy settings here");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");

    server.close().await;
    drop(server);
    if let Err(e) = logger.await {
        tracing::error!(error = %e, "Event logger ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
