//! Chain-change events published by the indexer to its host.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something the host may want to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexerEvent {
    /// A block was connected and is now the tip.
    Added { hash: String, height: u64 },
    /// The tip block was disconnected during a reorg.
    Removed { hash: String, height: u64 },
    /// A sync pass finished and the node reports it is fully synced.
    Synced { height: u64 },
    /// A sync pass aborted; the index needs operator attention.
    Fatal { error: String },
}

/// Fan-out channel for [`IndexerEvent`]s.
///
/// Publishing never blocks; events sent while nobody is subscribed are
/// dropped, and a slow subscriber observes `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IndexerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: IndexerEvent) {
        // Err only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
