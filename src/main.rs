use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fitslot::compactor;
use fitslot::config::{Config, Seed};
use fitslot::engine::Engine;
use fitslot::gate::InMemoryRelationships;
use fitslot::http;
use fitslot::ledger::InMemoryLedger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    fitslot::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let gate = Arc::new(InMemoryRelationships::new());
    let ledger = Arc::new(InMemoryLedger::new());
    if let Some(path) = &config.seed_file {
        let seed = Seed::load(path)?;
        seed.apply(&gate, &ledger);
        info!(
            "seeded {} relationships and {} purchases from {}",
            seed.relationships.len(),
            seed.purchases.len(),
            path.display()
        );
    }

    let engine = Arc::new(Engine::new(config.wal_path(), gate, ledger)?);
    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("fitslot listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    axum::serve(listener, http::router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("fitslot stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
