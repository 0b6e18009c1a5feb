//! Persistent index store: the ordered key-value contract the indexer
//! writes through.
//!
//! The production backend is `RocksStore` in `stampindex-storage`;
//! [`MemoryStore`] backs tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::IndexerError;

/// A single mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Ordered, durable key-value store.
///
/// `write_batch` must apply every operation or none of them.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Point read.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError>;

    /// Apply all operations atomically.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), IndexerError>;

    /// Ascending scan over `[start, end)`.
    async fn range(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError>;

    /// Flush and release the store. Later calls fail.
    async fn close(&self) -> Result<(), IndexerError>;
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// In-memory store for tests and short-lived indexers.
///
/// Counts committed batches and can be told to fail the next write, which
/// lets tests observe commit behaviour directly.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    batches: AtomicU64,
    fail_next_write: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches committed so far.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Make the next `write_batch` fail without applying anything.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Copy of the full keyspace.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), IndexerError> {
        if self.is_closed() {
            return Err(IndexerError::Storage("store is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        self.ensure_open()?;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), IndexerError> {
        self.ensure_open()?;
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(IndexerError::Storage("injected write failure".into()));
        }
        let mut data = self.data.lock();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn range(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
        self.ensure_open()?;
        if start >= end {
            return Ok(vec![]);
        }
        Ok(self
            .data
            .lock()
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
