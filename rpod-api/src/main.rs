use anyhow::{Context, Result};
use clap::Parser;
use rpod_api::{create_app, AppState};
use rpod_config::ServiceConfig;
use rpod_orchestrator::{ReapPolicy, SessionReaper};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rpod-api", version, about = "Per-user RStudio session service")]
struct Args {
    /// YAML config file; overrides environment defaults. Falls back to RPOD_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = rpod_logging::init_subscriber();

    info!("Starting rpod-api service...");

    let mut config = ServiceConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    info!(
        bind_addr = %config.bind_addr,
        backend = %config.backend,
        users_file = %config.users_file.display(),
        port_range = %config.port_range,
        "Configuration loaded"
    );

    let state = AppState::from_config(&config)?;
    let shutdown = CancellationToken::new();

    let reaper = SessionReaper::new(state.orchestrator.clone(), ReapPolicy::from_config(&config));
    let reaper_task = tokio::spawn(reaper.run(shutdown.child_token()));

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("Listening on http://{}", config.bind_addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("Shutdown signal received, draining requests");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = reaper_task.await;
    info!("rpod-api stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
