use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard::auth::DevTokenVerifier;
use switchboard::state::AppState;
use switchboard::{telemetry, ws};
use switchconf::SwitchConfig;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "switchboard", about = "Stateless WebSocket request gateway")]
struct Args {
    /// Config file path (replaces the local ./switchboard.toml override)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the WebSocket port
    #[arg(long)]
    port: Option<u16>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SwitchConfig::load_from(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind.ws_port = port;
    }
    if let Some(log_level) = args.log_level {
        config.telemetry.log_level = log_level;
    }

    telemetry::init(&config.telemetry)?;

    let state = AppState::build(config.clone(), Arc::new(DevTokenVerifier))?;
    let (processor_task, sweeper_task) = state.spawn_background();

    let addr = format!("{}:{}", config.bind.ws_addr, config.bind.ws_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "switchboard listening");

    let app = ws::app(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.cancel.clone()))
        .await
        .context("server error")?;

    // Shutdown ordering: stop intake (done), stop the processor and
    // sweeper, then drain the send pool within its deadline.
    state.cancel.cancel();
    let _ = processor_task.await;
    let _ = sweeper_task.await;
    if let Err(e) = state.sender.shutdown(Duration::from_secs(10)).await {
        tracing::warn!(error = %e, "send pool did not drain cleanly");
    }
    telemetry::shutdown()?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
    tracing::info!("shutdown signal received");
}
