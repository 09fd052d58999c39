use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

use config::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if args.json_logs {
        config.logging.format = LogFormat::Json;
    }
    init_tracing(config.logging.format);

    if config.uses_default_jwt_secret() {
        tracing::warn!("auth.jwt_secret is the built-in default; set POLLCAST_JWT_SECRET before exposing this server");
    }

    ensure_database_dir(&config.database.url);
    let db = pollcast_db::create_pool(&config.database.url, config.database.max_connections).await?;
    pollcast_db::run_migrations(&db).await?;

    let bus = pollcast_bus::Bus::connect(&config.bus.url).await?;
    let state = pollcast_core::AppState::new(db, bus, config.app_config());
    let subscriber = state.start_update_subscriber().await?;

    let app = pollcast_api::build_router(&state)
        .merge(pollcast_ws::gateway_router())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        node_id = %state.config.node_id,
        bus = state.bus.backend_name(),
        "pollcast listening on {}",
        config.server.bind_address
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
    .await?;

    if tokio::time::timeout(std::time::Duration::from_secs(2), subscriber)
        .await
        .is_err()
    {
        tracing::warn!("update subscriber did not stop in time");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pollcast=info,tower_http=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Create the parent directory of a file-backed SQLite database.
fn ensure_database_dir(database_url: &str) {
    let Some(path) = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
    else {
        return;
    };
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return;
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Could not create directory '{}': {}", parent.display(), e);
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM, then tells every connection and the
/// update subscriber to stop.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
    shutdown.cancel();
}
