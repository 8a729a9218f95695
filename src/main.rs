//! netgate - a multi-protocol TCP server gateway
//!
//! Usage:
//!     netgate [--config <path>]
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use netgate::config::{load_config, Config};
use netgate::pipeline::Sinks;
use netgate::util::init_logging;
use netgate::Server;

/// Serve MQTT, WebSocket, and line-delimited TCP from one process.
#[derive(Parser, Debug)]
#[command(name = "netgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults are used when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => load_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };

    // Determine log level (CLI overrides config)
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    // Initialize logging
    init_logging(log_level, &config.global.log_format);

    // If --validate flag, just validate and exit
    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  mqtt:      {}", config.listen_addr(config.mqtt.port));
        println!(
            "  websocket: {} (path {})",
            config.listen_addr(config.websocket.port),
            config.websocket.path
        );
        println!("  tcp:       {}", config.listen_addr(config.tcp.port));
        return Ok(());
    }

    info!(
        config_path = ?cli.config,
        mqtt_port = config.mqtt.port,
        websocket_port = config.websocket.port,
        tcp_port = config.tcp.port,
        "netgate starting"
    );

    run(config)
}

/// Run the server on a control runtime until Ctrl+C.
fn run(config: Config) -> Result<()> {
    // Listeners and connections run on the server's own pools.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create control runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let shutdown_timeout = config.shutdown_timeout;
    let server = Server::new(config, Sinks::logging());

    server.start().await.context("failed to start server")?;

    info!("netgate is running");
    info!("press Ctrl+C to stop");

    // Wait for shutdown signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    let stopped = server.stop(shutdown_timeout).await;
    info!(
        listeners = stopped.listeners_drained,
        graceful = stopped.graceful,
        "netgate shut down complete"
    );
    Ok(())
}
