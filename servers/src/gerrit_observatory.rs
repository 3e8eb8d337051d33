//! # Gerrit Observatory
//!
//! Streams `gerrit stream-events` over SSH, matches every event against the
//! registered subscriptions and POSTs matches to their webhooks. Subscriptions
//! are managed through the admin HTTP API and persisted in Redis (or in memory
//! with `--redis-url memory`).

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use lib_observatory::connections::store_redis::RedisStore;
use lib_observatory::{MemoryStore, Registry, SubscriptionStore};

mod observatory_logic;
use observatory_logic::{api, config, logger, state, upstream};

async fn open_store(settings: &config::Settings) -> Result<Arc<dyn SubscriptionStore>> {
    if settings.uses_memory_store() {
        info!("Using the in-memory subscription store; nothing survives a restart.");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(&settings.redis_url)
        .await
        .with_context(|| format!("cannot open subscription store at {}", settings.redis_url))?;
    info!("Connected to subscription store at {}", settings.redis_url);
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config();
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let store = open_store(&settings).await?;
    let registry = Arc::new(Registry::new(Arc::clone(&store), settings.registry())?);
    let persisted = store.list_all().await.context("cannot list persisted subscriptions")?;
    let restored = registry.restore(persisted).await;
    if restored.skipped > 0 {
        warn!(
            "{} stored subscriptions could not be restored; see the registry errors above",
            restored.skipped
        );
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::AppState::new(Arc::clone(&registry));

    let upstream_handle = tokio::spawn(upstream::run(
        settings.clone(),
        Arc::clone(&registry),
        shutdown_tx.subscribe(),
    ));

    let api_handle = tokio::spawn(api::run(settings.http_port, app_state, shutdown_tx.subscribe()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            info!("SIGTERM received, initiating shutdown.");
        }
    }

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let (upstream_result, api_result) = tokio::join!(upstream_handle, api_handle);
    upstream_result.context("upstream task panicked")?;
    api_result.context("admin API task panicked")??;

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
