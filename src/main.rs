//! PulseWatch - endpoint probing engine.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsewatch::config::EngineConfig;
use pulsewatch::engine::Engine;
use pulsewatch::notify::HttpNotifier;
use pulsewatch::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pulsewatch=info".parse()?),
        )
        .init();

    // Load configuration
    let cfg = EngineConfig::load();
    tracing::info!(
        workers = cfg.worker_count,
        global_rate_limit = cfg.global_rate_limit_per_minute,
        "Starting PulseWatch..."
    );
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let engine = Engine::new(
        &cfg,
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(HttpNotifier::new()),
    );

    engine.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    engine.stop().await;
    tracing::info!("Engine stopped");

    Ok(())
}
