use std::sync::Arc;
use token_event_indexer::{
    config,
    db::SqliteStore,
    rpc::AlloyChainSource,
    stats::PipelineStats,
    Coordinator, CoordinatorSettings, PersistenceSink, SinkSettings,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Token event indexer starting...");

    // Starting: configuration only, no I/O beyond reading the ABIs
    let cfg = config::load()?;
    let subscriptions = cfg.subscriptions()?;
    for spec in &subscriptions {
        info!("  Watching {}", spec);
    }

    let store = Arc::new(SqliteStore::connect(&cfg.store)?);
    let source = Arc::new(AlloyChainSource::connect(&cfg.provider_url).await?);

    let sink = PersistenceSink::new(store, SinkSettings::from(&cfg), Arc::new(PipelineStats::default()));
    let coordinator = Coordinator::new(source, sink, subscriptions, CoordinatorSettings::from(&cfg));

    let summary = coordinator.run(shutdown_signal()).await?;
    if summary.abandoned_writes > 0 {
        warn!("{} writes were abandoned at shutdown", summary.abandoned_writes);
    }
    info!("Token event indexer stopped.");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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
}
