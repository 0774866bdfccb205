use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use gymsched::config::Config;
use gymsched::engine::Engine;
use gymsched::replica::{Applied, FeedMessage, Replica};
use gymsched::resolver::ReferenceResolver;
use gymsched::store::MemoryStore;

/// Apply newline-delimited JSON feed messages from stdin until EOF.
async fn follow_feed(replica: Arc<Replica>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("replication feed closed");
                return;
            }
            Err(e) => {
                warn!("replication feed read error: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FeedMessage>(&line) {
            Ok(message) => {
                if let Some(Applied::Gap { expected }) = replica.handle(message) {
                    warn!("feed gap, waiting for redelivery from seq {expected}");
                }
            }
            Err(e) => warn!("skipping malformed feed line: {e}"),
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    gymsched::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(MemoryStore::open(&config.wal_path())?);
    let replica = Arc::new(Replica::new());
    let resolver = ReferenceResolver::new(replica.clone(), config.resolve_timeout);
    let engine = Arc::new(Engine::with_store(store.clone(), resolver));

    info!("gymsched started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  resolve_timeout: {:?}", config.resolve_timeout);
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper = tokio::spawn(gymsched::sweep::run_sweeper(
        engine,
        store.clone(),
        config.sweep_interval,
        config.compact_threshold,
    ));
    let feed = tokio::spawn(follow_feed(replica));

    shutdown_signal().await?;
    info!("shutdown signal received");
    sweeper.abort();
    feed.abort();

    if let Err(e) = store.compact().await {
        warn!("final compaction failed: {e}");
    }
    info!("gymsched stopped");
    Ok(())
}
