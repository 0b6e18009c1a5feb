//! `stampindex run` — the daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};

use stampindex_api::{ApiServer, QueryService};
use stampindex_core::{ChainIndexer, IndexStore, IndexerEvent, Service};
use stampindex_rpc::BitcoindClient;
use stampindex_storage::RocksStore;

use crate::config::DaemonConfig;

/// Wait for a fatal indexer event; `None` if the event channel closed.
async fn next_fatal(events: &mut broadcast::Receiver<IndexerEvent>) -> Option<String> {
    loop {
        match events.recv().await {
            Ok(IndexerEvent::Fatal { error }) => return Some(error),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Event subscriber lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn start(service: &dyn Service) -> Result<()> {
    tracing::info!(
        service = service.name(),
        depends_on = ?service.dependencies(),
        "Starting service"
    );
    service
        .start()
        .await
        .with_context(|| format!("start {}", service.name()))
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    let network = config.node.network()?;
    let store = Arc::new(
        RocksStore::open_for_network(&config.node.datadir, network).context("open index store")?,
    );
    let node = Arc::new(BitcoindClient::from_config(&config.node)?);
    tracing::info!(%network, url = %node.url(), store = %store.path().display(), "Starting stampindex");

    let poller = node.spawn_tip_poller(config.node.tip_poll_interval());
    let indexer = ChainIndexer::new(config.indexer.clone(), store.clone(), node.clone());
    let mut events = indexer.subscribe();

    if let Err(e) = start(&indexer).await {
        poller.abort();
        store.close().await?;
        return Err(e.context("the index may need to be rebuilt"));
    }

    let api = ApiServer::new(
        config.api.clone(),
        Arc::new(
            QueryService::new(store.clone(), node.clone())
                .with_max_concurrent_lookups(config.api.max_concurrent_lookups),
        ),
    );
    if let Err(e) = start(&api).await {
        poller.abort();
        indexer.stop().await?;
        return Err(e);
    }

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for shutdown signal")?;
            tracing::info!("Interrupt received; shutting down");
            None
        }
        Some(error) = next_fatal(&mut events) => Some(error),
    };

    api.stop().await?;
    indexer.stop().await?;
    poller.abort();

    match fatal {
        Some(error) => Err(anyhow::anyhow!("indexer stopped on fatal error: {error}")),
        None => Ok(()),
    }
}
