//! The chain indexer: tip tracking, the sync loop and reorg rewind.
//!
//! # Startup
//! `load_tip` reads the tip record. With no record the genesis block is
//! connected and becomes the tip. Otherwise the recorded hash is resolved
//! against the node, retrying a bounded number of times; exhaustion is fatal
//! and leaves the store untouched.
//!
//! # Sync pass
//! While the local tip is behind the node, fetch the block at `tip + 1`:
//!   - it extends the tip: connect it (entries + tip record, one batch)
//!   - it does not: disconnect the tip and re-evaluate the same height
//!
//! Only one pass (or tip load) runs at a time. `stop` waits for it to drain
//! before closing the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::error::IndexerError;
use crate::events::{EventBus, IndexerEvent};
use crate::indexer::{IndexerConfig, IndexerState};
use crate::keys::{block_entries, decode_tip, encode_tip, TIP_KEY};
use crate::node::NodeClient;
use crate::retry::RetryPolicy;
use crate::service::Service;
use crate::store::{BatchOp, IndexStore};
use crate::types::{Block, ChainTip};

/// Outcome of a call to [`ChainIndexer::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Another pass was running, shutdown was requested, or no tip is loaded.
    Skipped,
    /// Shutdown was requested while the pass was running.
    Interrupted,
    /// Caught up with the node.
    Completed { height: u64, synced: bool },
}

/// Holds the in-progress flag for the lifetime of one pass.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    config: IndexerConfig,
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    events: EventBus,
    tip: RwLock<Option<ChainTip>>,
    state: RwLock<IndexerState>,
    syncing: AtomicBool,
    stopping: AtomicBool,
    stop_signal: Notify,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps the digest index in step with the node's active chain.
///
/// Cheap to clone; clones share the same tip, flags and store.
#[derive(Clone)]
pub struct ChainIndexer {
    inner: Arc<Inner>,
}

impl ChainIndexer {
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn IndexStore>,
        node: Arc<dyn NodeClient>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                node,
                events,
                tip: RwLock::new(None),
                state: RwLock::new(IndexerState::Uninitialized),
                syncing: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                stop_signal: Notify::new(),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to chain-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.inner.events.subscribe()
    }

    /// The current in-memory tip, if one is established.
    pub fn tip(&self) -> Option<ChainTip> {
        self.inner.tip.read().clone()
    }

    pub fn state(&self) -> IndexerState {
        *self.inner.state.read()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: IndexerState) {
        *self.inner.state.write() = state;
    }

    fn set_tip(&self, tip: ChainTip) {
        *self.inner.tip.write() = Some(tip);
    }

    // ─── Startup ──────────────────────────────────────────────────────────────

    /// Establish the in-memory tip from the tip record.
    pub async fn load_tip(&self) -> Result<ChainTip, IndexerError> {
        let Some(_guard) = PassGuard::acquire(&self.inner.syncing) else {
            return Err(IndexerError::Other("tip load while a pass is running".into()));
        };
        self.set_state(IndexerState::LoadingTip);

        let result = match self.inner.store.get(TIP_KEY).await {
            Ok(None) => self.bootstrap_genesis().await,
            Ok(Some(raw)) => self.resolve_tip(decode_tip(&raw)).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(tip) => {
                tracing::info!(height = tip.height, hash = %tip.hash(), "Tip loaded");
                self.set_tip(tip.clone());
                if !self.is_stopping() {
                    self.set_state(IndexerState::Idle);
                }
                Ok(tip)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load tip");
                if !self.is_stopping() {
                    self.set_state(IndexerState::Uninitialized);
                }
                Err(e)
            }
        }
    }

    async fn bootstrap_genesis(&self) -> Result<ChainTip, IndexerError> {
        let raw = self.inner.node.genesis_block().await?;
        let genesis = Block::from_raw(&raw)?;
        tracing::info!(hash = %genesis.hash, "No tip record; starting from genesis");

        self.connect_block(&genesis, 0).await?;
        self.inner.events.publish(IndexerEvent::Added {
            hash: genesis.hash.clone(),
            height: 0,
        });
        Ok(ChainTip::new(0, genesis))
    }

    async fn resolve_tip(&self, hash: String) -> Result<ChainTip, IndexerError> {
        let block = self.fetch_tip_block(&hash).await?;
        let header = match self.inner.node.block_header(&hash).await {
            Ok(Some(header)) => header,
            Ok(None) => return Err(IndexerError::TipHeightUnknown { hash }),
            Err(e) => {
                tracing::warn!(%hash, error = %e, "Header lookup failed");
                return Err(IndexerError::TipHeightUnknown { hash });
            }
        };
        Ok(ChainTip::new(header.height, block))
    }

    /// Fetch the recorded tip block, retrying per the configured policy.
    async fn fetch_tip_block(&self, hash: &str) -> Result<Block, IndexerError> {
        let policy = RetryPolicy::new(self.inner.config.retry());
        let mut attempt = 0u32;
        loop {
            if self.is_stopping() {
                return Err(IndexerError::Aborted {
                    reason: "stop requested during tip resolution".into(),
                });
            }
            attempt += 1;

            match self.inner.node.raw_block(hash).await {
                Ok(raw) => return Block::from_raw(&raw),
                Err(e) => {
                    tracing::warn!(
                        %hash,
                        attempt,
                        max_attempts = policy.config.max_attempts,
                        error = %e,
                        "Node does not have our tip; the node may need to reindex"
                    );
                }
            }

            let Some(delay) = policy.next_delay(attempt) else {
                return Err(IndexerError::TipUnavailable {
                    hash: hash.to_string(),
                    attempts: attempt,
                });
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.inner.stop_signal.notified() => {}
            }
        }
    }

    // ─── Sync ─────────────────────────────────────────────────────────────────

    /// Bring the index up to the node's chain height.
    ///
    /// Returns [`SyncStatus::Skipped`] without touching anything if a pass
    /// is already running. A failed pass publishes [`IndexerEvent::Fatal`]
    /// and is not retried.
    pub async fn sync(&self) -> Result<SyncStatus, IndexerError> {
        let Some(_guard) = PassGuard::acquire(&self.inner.syncing) else {
            return Ok(SyncStatus::Skipped);
        };
        if self.is_stopping() || self.tip().is_none() {
            return Ok(SyncStatus::Skipped);
        }
        self.set_state(IndexerState::Syncing);

        let result = self.sync_pass().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, fatal = e.is_fatal(), "Sync pass aborted");
            self.inner.events.publish(IndexerEvent::Fatal {
                error: e.to_string(),
            });
        }
        if !self.is_stopping() {
            self.set_state(IndexerState::Idle);
        }
        result
    }

    async fn sync_pass(&self) -> Result<SyncStatus, IndexerError> {
        let max_depth = self.inner.config.max_reorg_depth;
        let mut rewound = 0u64;

        let tip = loop {
            if self.is_stopping() {
                return Ok(SyncStatus::Interrupted);
            }
            let tip = self.tip().ok_or_else(|| IndexerError::Other("no tip loaded".into()))?;
            let node_height = self.inner.node.chain_height().await?;
            if tip.height >= node_height {
                break tip;
            }

            let target = tip.height + 1;
            let raw = self.inner.node.raw_block_at(target).await?;
            let block = Block::from_raw(&raw)?;

            if block.extends(&tip) {
                self.connect_block(&block, target).await?;
                let hash = block.hash.clone();
                self.set_tip(ChainTip::new(target, block));
                self.inner.events.publish(IndexerEvent::Added { hash, height: target });
                rewound = 0;
            } else {
                tracing::warn!(
                    height = target,
                    tip = %tip.hash(),
                    prev = %block.prev_hash,
                    "Reorg detected"
                );
                if rewound >= max_depth {
                    return Err(IndexerError::ReorgTooDeep {
                        height: tip.height,
                        max_depth,
                    });
                }
                rewound += 1;
                self.disconnect_tip().await?;
            }
        };

        let synced = self.inner.node.is_synced().await?;
        if synced {
            tracing::info!(height = tip.height, "Index synced with node");
            self.inner.events.publish(IndexerEvent::Synced { height: tip.height });
        }
        Ok(SyncStatus::Completed {
            height: tip.height,
            synced,
        })
    }

    /// Disconnect the current tip and make its predecessor the tip.
    pub(crate) async fn disconnect_tip(&self) -> Result<ChainTip, IndexerError> {
        let tip = self.tip().ok_or_else(|| IndexerError::Other("no tip loaded".into()))?;
        if tip.height == 0 {
            return Err(IndexerError::Other("cannot disconnect the genesis block".into()));
        }

        let raw = self.inner.node.raw_block(tip.prev_hash()).await?;
        let prev = Block::from_raw(&raw)?;

        self.disconnect_block(&tip.block, tip.height).await?;
        let new_tip = ChainTip::new(tip.height - 1, prev);
        self.set_tip(new_tip.clone());

        tracing::warn!(
            height = tip.height,
            hash = %tip.hash(),
            new_tip = %new_tip.hash(),
            "Disconnected block"
        );
        self.inner.events.publish(IndexerEvent::Removed {
            hash: tip.hash().to_string(),
            height: tip.height,
        });
        Ok(new_tip)
    }

    // ─── Connect / disconnect ─────────────────────────────────────────────────

    /// Write `block`'s entries and point the tip record at it, in one batch.
    pub(crate) async fn connect_block(&self, block: &Block, height: u64) -> Result<(), IndexerError> {
        let entries = block_entries(block, height);
        let mut ops: Vec<BatchOp> = entries
            .iter()
            .map(|entry| BatchOp::put(entry.key(), entry.value()))
            .collect();
        ops.push(BatchOp::put(TIP_KEY, encode_tip(&block.hash)?));

        self.inner.store.write_batch(ops).await?;
        tracing::info!(height, hash = %block.hash, entries = entries.len(), "Connected block");
        Ok(())
    }

    /// Delete `block`'s entries and point the tip record at its parent, in one batch.
    pub(crate) async fn disconnect_block(
        &self,
        block: &Block,
        height: u64,
    ) -> Result<(), IndexerError> {
        let entries = block_entries(block, height);
        let mut ops: Vec<BatchOp> = entries
            .iter()
            .map(|entry| BatchOp::delete(entry.key()))
            .collect();
        ops.push(BatchOp::put(TIP_KEY, encode_tip(&block.prev_hash)?));

        self.inner.store.write_batch(ops).await?;
        tracing::debug!(height, hash = %block.hash, entries = entries.len(), "Removed block entries");
        Ok(())
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    async fn follow_tips(self, mut tips: watch::Receiver<u64>) {
        loop {
            if self.sync().await.is_err() || self.is_stopping() {
                break;
            }
            if tips.changed().await.is_err() {
                tracing::debug!("Tip notifications closed");
                break;
            }
            tracing::debug!(node_height = *tips.borrow(), "Tip changed");
        }
    }

    /// Stop syncing, wait for the active pass to drain, then close the store.
    /// Calling it again after it completed is a no-op.
    pub async fn shutdown(&self) -> Result<(), IndexerError> {
        if self.state() == IndexerState::Stopped {
            return Ok(());
        }
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.stop_signal.notify_one();
        self.set_state(IndexerState::Stopping);

        let poll = self.inner.config.stop_poll_interval();
        while self.is_syncing() {
            tokio::time::sleep(poll).await;
        }
        let watcher = self.inner.watcher.lock().take();
        if let Some(handle) = watcher {
            handle.abort();
        }

        self.inner.store.close().await?;
        self.set_state(IndexerState::Stopped);
        tracing::info!("Indexer stopped");
        Ok(())
    }
}

#[async_trait]
impl Service for ChainIndexer {
    fn name(&self) -> &str {
        "stampindex"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["bitcoind"]
    }

    /// Load the tip, then follow the node's tip notifications in a
    /// background task.
    async fn start(&self) -> Result<(), IndexerError> {
        let tips = self.inner.node.subscribe_tip();
        self.load_tip().await?;

        let indexer = self.clone();
        let handle = tokio::spawn(indexer.follow_tips(tips));
        *self.inner.watcher.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexerError> {
        self.shutdown().await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::keys::{digest_range, IndexEntry};
    use crate::store::MemoryStore;
    use crate::testing::{MockNode, TestChain};

    fn fast_config() -> IndexerConfig {
        IndexerConfig {
            tip_retry_interval_ms: 1,
            stop_poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn setup(chain: &TestChain) -> (ChainIndexer, Arc<MemoryStore>, Arc<MockNode>) {
        setup_with(chain, fast_config())
    }

    fn setup_with(
        chain: &TestChain,
        config: IndexerConfig,
    ) -> (ChainIndexer, Arc<MemoryStore>, Arc<MockNode>) {
        let store = Arc::new(MemoryStore::new());
        let node = Arc::new(MockNode::new(chain));
        let indexer = ChainIndexer::new(config, store.clone(), node.clone());
        (indexer, store, node)
    }

    fn drain(rx: &mut broadcast::Receiver<IndexerEvent>) -> Vec<IndexerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn entries_for(store: &MemoryStore, digest: &str) -> Vec<IndexEntry> {
        let (start, end) = digest_range(digest);
        store
            .range(&start, &end)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, v)| IndexEntry::decode(&k, &v).unwrap())
            .collect()
    }

    fn index_keys(snapshot: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<Vec<u8>> {
        snapshot.keys().filter(|k| k.as_slice() != TIP_KEY).cloned().collect()
    }

    /// Store that records every batch it is handed.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        batches: Mutex<Vec<Vec<BatchOp>>>,
    }

    #[async_trait]
    impl IndexStore for RecordingStore {
        async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
            self.inner.get(key).await
        }

        async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), IndexerError> {
            self.batches.lock().push(ops.clone());
            self.inner.write_batch(ops).await
        }

        async fn range(
            &self,
            start: &[u8],
            end: &[u8],
        ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
            self.inner.range(start, end).await
        }

        async fn close(&self) -> Result<(), IndexerError> {
            self.inner.close().await
        }
    }

    // ─── Startup ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_tip_record_connects_genesis_once() {
        let chain = TestChain::new();
        let (indexer, store, _node) = setup(&chain);
        let mut events = indexer.subscribe();

        let tip = indexer.load_tip().await.unwrap();
        assert_eq!(tip.height, 0);
        assert_eq!(tip.hash(), chain.hash(0));
        assert_eq!(store.batch_count(), 1);
        assert_eq!(
            store.get(TIP_KEY).await.unwrap(),
            Some(encode_tip(&chain.hash(0)).unwrap())
        );
        assert_eq!(
            drain(&mut events),
            vec![IndexerEvent::Added {
                hash: chain.hash(0),
                height: 0
            }]
        );
        assert_eq!(indexer.state(), IndexerState::Idle);

        // A restart resumes from the record instead of reconnecting genesis.
        let restarted = ChainIndexer::new(fast_config(), store.clone(), Arc::new(MockNode::new(&chain)));
        let tip = restarted.load_tip().await.unwrap();
        assert_eq!(tip.height, 0);
        assert_eq!(store.batch_count(), 1);
    }

    #[tokio::test]
    async fn persisted_tip_resumes_at_recorded_height() {
        let mut chain = TestChain::new();
        chain.mine_empty(4);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();

        let restarted = ChainIndexer::new(fast_config(), store.clone(), node);
        let tip = restarted.load_tip().await.unwrap();
        assert_eq!(tip.height, 4);
        assert_eq!(tip.hash(), chain.hash(4));
    }

    #[tokio::test]
    async fn unknown_tip_fails_startup_after_three_attempts() {
        let mut chain = TestChain::new();
        chain.mine(&[&[0xaa]]);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();
        let before = store.snapshot();
        let batches = store.batch_count();

        node.forget_block(&chain.hash(1));
        let requests = node.block_requests();
        let restarted = ChainIndexer::new(fast_config(), store.clone(), node.clone());
        let err = restarted.load_tip().await.unwrap_err();

        assert!(matches!(err, IndexerError::TipUnavailable { attempts: 3, .. }));
        assert!(err.is_fatal());
        assert_eq!(node.block_requests() - requests, 3);
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.batch_count(), batches);
        assert!(restarted.tip().is_none());
        assert!(!restarted.is_syncing());
    }

    #[tokio::test]
    async fn stop_interrupts_tip_retry() {
        let mut chain = TestChain::new();
        chain.mine_empty(1);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();
        node.forget_block(&chain.hash(1));

        let slow = IndexerConfig {
            tip_retry_interval_ms: 60_000,
            stop_poll_interval_ms: 1,
            ..Default::default()
        };
        let restarted = ChainIndexer::new(slow, store.clone(), node);
        let loading = tokio::spawn({
            let restarted = restarted.clone();
            async move { restarted.load_tip().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), restarted.shutdown())
            .await
            .unwrap()
            .unwrap();
        let result = loading.await.unwrap();
        assert!(matches!(result, Err(IndexerError::Aborted { .. })));
        assert!(store.is_closed());
    }

    // ─── Sync ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_connects_blocks_in_order() {
        let mut chain = TestChain::new();
        chain.mine(&[&[0xde, 0xad, 0xbe, 0xef]]);
        chain.mine_empty(1);
        chain.mine(&[&[0x01], &[0xde, 0xad, 0xbe, 0xef]]);
        let (indexer, store, _node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        let mut events = indexer.subscribe();

        let status = indexer.sync().await.unwrap();
        assert_eq!(status, SyncStatus::Completed { height: 3, synced: true });
        assert_eq!(indexer.tip().unwrap().hash(), chain.hash(3));

        let heights: Vec<u64> = entries_for(&store, "deadbeef")
            .await
            .iter()
            .map(|e| e.height)
            .collect();
        assert_eq!(heights, vec![1, 3]);
        assert_eq!(entries_for(&store, "01").await.len(), 1);

        let events = drain(&mut events);
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], IndexerEvent::Synced { height: 3 });
    }

    #[tokio::test]
    async fn entry_records_location_and_block_hash() {
        let mut chain = TestChain::new();
        let block = chain.mine(&[&[0xca, 0xfe]]);
        let (indexer, store, _node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();

        let entries = entries_for(&store, "cafe").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].height, 1);
        assert_eq!(entries[0].txid, block.txdata[1].compute_txid().to_string());
        assert_eq!(entries[0].output_index, 1);
        assert_eq!(entries[0].block_hash, chain.hash(1));
    }

    #[tokio::test]
    async fn unsynced_node_emits_no_synced_event() {
        let mut chain = TestChain::new();
        chain.mine_empty(2);
        let (indexer, _store, node) = setup(&chain);
        node.set_synced(false);
        indexer.load_tip().await.unwrap();
        let mut events = indexer.subscribe();

        let status = indexer.sync().await.unwrap();
        assert_eq!(status, SyncStatus::Completed { height: 2, synced: false });
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, IndexerEvent::Synced { .. })));
    }

    #[tokio::test]
    async fn sync_without_tip_is_skipped() {
        let chain = TestChain::new();
        let (indexer, store, _node) = setup(&chain);
        assert_eq!(indexer.sync().await.unwrap(), SyncStatus::Skipped);
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn sync_during_active_pass_commits_nothing() {
        let mut chain = TestChain::new();
        chain.mine_empty(5);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        node.set_fetch_delay(Duration::from_millis(20));

        let pass = tokio::spawn({
            let indexer = indexer.clone();
            async move { indexer.sync().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(indexer.is_syncing());
        assert_eq!(indexer.state(), IndexerState::Syncing);

        assert_eq!(indexer.sync().await.unwrap(), SyncStatus::Skipped);
        let status = pass.await.unwrap().unwrap();
        assert_eq!(status, SyncStatus::Completed { height: 5, synced: true });
        // genesis + five blocks
        assert_eq!(store.batch_count(), 6);
        assert!(!indexer.is_syncing());
    }

    #[tokio::test]
    async fn failed_commit_is_fatal_and_clears_flag() {
        let mut chain = TestChain::new();
        chain.mine(&[&[0xab]]);
        let (indexer, store, _node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        let mut events = indexer.subscribe();

        store.fail_next_write();
        let err = indexer.sync().await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
        assert!(!indexer.is_syncing());
        assert_eq!(indexer.tip().unwrap().height, 0);
        assert!(entries_for(&store, "ab").await.is_empty());
        assert!(matches!(
            drain(&mut events).as_slice(),
            [IndexerEvent::Fatal { .. }]
        ));

        // Nothing is retried automatically, but the next call makes progress.
        assert_eq!(
            indexer.sync().await.unwrap(),
            SyncStatus::Completed { height: 1, synced: true }
        );
    }

    // ─── Connect / disconnect ─────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_writes_entries_and_one_tip_update_per_batch() {
        let mut chain = TestChain::new();
        chain.mine(&[&[0x11], &[0x22]]);
        chain.mine(&[&[0x33]]);
        let store = Arc::new(RecordingStore::default());
        let node = Arc::new(MockNode::new(&chain));
        let indexer = ChainIndexer::new(fast_config(), store.clone(), node);

        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();

        let batches = store.batches.lock().clone();
        assert_eq!(batches.len(), 3);
        for (height, batch) in batches.iter().enumerate() {
            let tip_writes: Vec<_> = batch.iter().filter(|op| op.key() == TIP_KEY).collect();
            assert_eq!(tip_writes.len(), 1);
            assert_eq!(
                tip_writes[0],
                &BatchOp::put(TIP_KEY, encode_tip(&chain.hash(height as u64)).unwrap())
            );
        }
        assert_eq!(batches[1].len(), 3);
        assert_eq!(batches[2].len(), 2);
    }

    #[tokio::test]
    async fn connect_then_disconnect_restores_store_and_tip() {
        let mut chain = TestChain::new();
        chain.mine(&[&[0x01]]);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();
        let before = store.snapshot();
        let tip_before = indexer.tip().unwrap();

        chain.mine(&[&[0x02], &[0x03, 0x04]]);
        node.set_chain(&chain);
        indexer.sync().await.unwrap();
        assert_eq!(indexer.tip().unwrap().height, 2);
        assert_ne!(store.snapshot(), before);

        let restored = indexer.disconnect_tip().await.unwrap();
        assert_eq!(store.snapshot(), before);
        assert_eq!(restored.hash(), tip_before.hash());
        assert_eq!(restored.height, tip_before.height);
    }

    #[tokio::test]
    async fn genesis_cannot_be_disconnected() {
        let chain = TestChain::new();
        let (indexer, _store, _node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        assert!(indexer.disconnect_tip().await.is_err());
    }

    // ─── Reorg ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reorg_replaces_stale_tip() {
        let mut chain = TestChain::new();
        chain.mine_empty(4);
        chain.mine(&[&[0x5a], &[0xcc]]);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();
        assert_eq!(indexer.tip().unwrap().height, 5);
        let stale = chain.hash(5);

        let mut fork = chain.fork_at(4);
        fork.mine_with_nonce(1, &[&[0x5b], &[0xcc]]);
        fork.mine(&[]);
        node.set_chain(&fork);
        let mut events = indexer.subscribe();

        let status = indexer.sync().await.unwrap();
        assert_eq!(status, SyncStatus::Completed { height: 6, synced: true });
        assert_eq!(indexer.tip().unwrap().hash(), fork.hash(6));

        assert!(entries_for(&store, "5a").await.is_empty());
        assert_eq!(entries_for(&store, "5b").await.len(), 1);
        let shared = entries_for(&store, "cc").await;
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].block_hash, fork.hash(5));

        assert_eq!(
            drain(&mut events),
            vec![
                IndexerEvent::Removed { hash: stale, height: 5 },
                IndexerEvent::Added { hash: fork.hash(5), height: 5 },
                IndexerEvent::Added { hash: fork.hash(6), height: 6 },
                IndexerEvent::Synced { height: 6 },
            ]
        );
    }

    #[tokio::test]
    async fn multi_block_reorg_rewinds_to_fork_point() {
        let mut chain = TestChain::new();
        chain.mine(&[&[0x01]]);
        chain.mine(&[&[0x02]]);
        chain.mine(&[&[0x03]]);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();

        let mut fork = chain.fork_at(1);
        fork.mine_with_nonce(7, &[&[0x12]]);
        fork.mine_with_nonce(7, &[]);
        fork.mine_with_nonce(7, &[]);
        node.set_chain(&fork);
        indexer.sync().await.unwrap();

        assert_eq!(indexer.tip().unwrap().hash(), fork.hash(4));
        assert_eq!(entries_for(&store, "01").await.len(), 1);
        assert!(entries_for(&store, "02").await.is_empty());
        assert!(entries_for(&store, "03").await.is_empty());
        assert_eq!(entries_for(&store, "12").await.len(), 1);
    }

    #[tokio::test]
    async fn reorg_deeper_than_limit_is_fatal() {
        let mut chain = TestChain::new();
        chain.mine_empty(5);
        let config = IndexerConfig {
            max_reorg_depth: 1,
            ..fast_config()
        };
        let (indexer, _store, node) = setup_with(&chain, config);
        indexer.load_tip().await.unwrap();
        indexer.sync().await.unwrap();

        let mut fork = chain.fork_at(3);
        fork.mine_with_nonce(9, &[]);
        fork.mine_with_nonce(9, &[]);
        fork.mine_with_nonce(9, &[]);
        node.set_chain(&fork);
        let mut events = indexer.subscribe();

        let err = indexer.sync().await.unwrap_err();
        assert!(matches!(err, IndexerError::ReorgTooDeep { height: 4, max_depth: 1 }));
        assert!(err.is_fatal());
        assert!(!indexer.is_syncing());
        assert!(matches!(
            drain(&mut events).last(),
            Some(IndexerEvent::Fatal { .. })
        ));
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    async fn wait_synced(events: &mut broadcast::Receiver<IndexerEvent>, height: u64) {
        let wait = async {
            loop {
                if let IndexerEvent::Synced { height: h } = events.recv().await.unwrap() {
                    if h == height {
                        break;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
    }

    #[tokio::test]
    async fn start_follows_tip_notifications_until_stopped() {
        let mut chain = TestChain::new();
        chain.mine_empty(2);
        let (indexer, store, node) = setup(&chain);
        let mut events = indexer.subscribe();

        indexer.start().await.unwrap();
        wait_synced(&mut events, 2).await;

        chain.mine(&[&[0x77]]);
        node.set_chain(&chain);
        wait_synced(&mut events, 3).await;
        assert_eq!(indexer.tip().unwrap().height, 3);
        assert_eq!(entries_for(&store, "77").await.len(), 1);

        indexer.stop().await.unwrap();
        assert_eq!(indexer.state(), IndexerState::Stopped);
        assert!(store.is_closed());
        indexer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_waits_for_active_pass() {
        let mut chain = TestChain::new();
        chain.mine_empty(20);
        let (indexer, store, node) = setup(&chain);
        indexer.load_tip().await.unwrap();
        node.set_fetch_delay(Duration::from_millis(5));

        let pass = tokio::spawn({
            let indexer = indexer.clone();
            async move { indexer.sync().await }
        });
        tokio::time::sleep(Duration::from_millis(15)).await;
        indexer.shutdown().await.unwrap();

        assert!(!indexer.is_syncing());
        assert!(store.is_closed());
        assert_eq!(pass.await.unwrap().unwrap(), SyncStatus::Interrupted);
        assert!(indexer.tip().unwrap().height < 20);
        assert_eq!(indexer.sync().await.unwrap(), SyncStatus::Skipped);
    }

    #[test]
    fn service_metadata() {
        let chain = TestChain::new();
        let (indexer, _store, _node) = setup(&chain);
        assert_eq!(indexer.name(), "stampindex");
        assert_eq!(indexer.dependencies(), &["bitcoind"]);
        assert_eq!(indexer.route_prefix(), "");
    }
}
