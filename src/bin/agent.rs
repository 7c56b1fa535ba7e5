use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use cdn_control::agent::Agent;
use cdn_control::config;

#[derive(Parser, Debug)]
#[command(name = "cdn-agent")]
#[command(about = "Edge delivery agent converging a node against its coordinator", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = config::load_agent_config().context("error loading config")?;

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

    info!("Starting CDN Control agent for instance {}", config.instance_id);

    let agent = Arc::new(Agent::new(config).context("error initializing agent")?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let loop_handle = tokio::spawn({
        let agent = agent.clone();
        async move {
            agent.run(shutdown_rx).await;
        }
    });

    shutdown_signal().await;

    info!("Stopping agent");
    let _ = shutdown_tx.send(());
    // the in-flight tick runs to completion before the loop exits
    let _ = loop_handle.await;

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
