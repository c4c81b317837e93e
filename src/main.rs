use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcpmux::cli::Cli;
use mcpmux::config::Config;
use mcpmux::manager::{Manager, NoServices};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.yolo {
        config.yolo = true;
    }

    // Logs to stderr so transports stay clean.
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(config_path = %cli.config.display(), "mcpmux starting");

    // Standalone mode: no orchestrator attached. The event stream stays
    // open but idle; embedders wire a real provider and stream instead.
    let (_event_tx, event_rx) = tokio::sync::mpsc::channel(64);
    let manager = Manager::new(config, Arc::new(NoServices), event_rx);
    manager.start().await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    manager.stop().await;
    Ok(())
}
