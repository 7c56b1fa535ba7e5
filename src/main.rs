use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use cdn_control::config;
use cdn_control::state::AppState;
use cdn_control::store::Store;
use cdn_control::web;

#[derive(Parser, Debug)]
#[command(name = "cdn-server")]
#[command(about = "Coordinator for a fleet of Caddy edge servers", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = config::load_server_config().context("error loading config")?;

    // development mode logs at debug unless overridden
    let log_level = if args.debug || !config.is_prod() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("cdn_control={log_level}").parse().unwrap()),
        )
        .init();

    info!("Starting CDN Control coordinator");
    info!("Listening on {}", config.listen);

    let store = Store::open(&config.db_conn)
        .await
        .context("error initializing store")?;

    let (state, _shutdown_rx) = AppState::new(config, store).context("error initializing state")?;

    let web_state = state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = web::start_server(web_state).await {
            error!("Coordinator API error: {}", e);
        }
    });

    shutdown_signal().await;

    info!("Shutting down coordinator");
    state.shutdown().await;

    if tokio::time::timeout(std::time::Duration::from_secs(30), server_handle)
        .await
        .is_err()
    {
        error!("Shutdown timeout exceeded, forcing exit");
        std::process::exit(1);
    }

    info!("Graceful shutdown completed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
