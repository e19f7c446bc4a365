#![forbid(unsafe_code)]
//! CashHandle API server with the Divvy payment monitor

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cashhandle::api::{run_api_server, AppState};
use cashhandle::config::{load_config, load_config_from};
use cashhandle::monitor::{DivvyMonitor, PaymentFeed};

#[derive(Parser)]
#[command(name = "cashhandle-server", version, about = "CashHandle token store API")]
struct Args {
    /// Path to config.toml (defaults to ./config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let port = args.port.unwrap_or(config.server.port);

    let state = Arc::new(AppState::from_config(&config)?);
    info!(
        database = %config.database.path,
        identity = ?config.handcash.mode,
        network = ?config.bsv.network,
        wallet = %state.wallet.address(),
        "store opened"
    );

    let monitor = if config.divvy.monitor_enabled {
        let feed: Arc<dyn PaymentFeed> = state.webhook_queue.clone();
        let monitor = Arc::new(DivvyMonitor::new(
            Arc::clone(&state.db),
            Arc::clone(&state.divvy),
            feed,
            config.divvy.poll_interval,
        ));
        monitor.start();
        Some(monitor)
    } else {
        info!("divvy monitor disabled");
        None
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutting down");
    };
    run_api_server(state, port, shutdown).await?;

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    Ok(())
}
