//! Process entrypoint: load config, wire up [`novel_aggregator::AppState`],
//! serve the REST façade, and tear everything down in the documented order
//! (task registry drains, then the HTTP pool closes, then the disk cache is
//! left as-is since it is already durable).

use novel_aggregator::{api, config::Config, logging, AppState};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("NOVEL_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));
    let config = Config::load(&config_path)?;
    logging::init(&config.log_filter);

    tracing::info!(bind_addr = %config.bind_addr, rules_dir = ?config.rules_dir, "starting novel-aggregator");

    let state = AppState::new(config.clone()).await?;
    tracing::info!(enabled_sources = state.sources.len(), "rules loaded");

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown signal received, draining in-flight tasks");
    let drain_deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while state.tasks.has_active_tasks() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    state.tasks.garbage_collect();
    tracing::info!("task registry drained, closing http pool");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to install ctrl-c handler");
        });
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install sigterm handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
