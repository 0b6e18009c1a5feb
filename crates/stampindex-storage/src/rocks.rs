//! RocksDB implementation of [`IndexStore`].
//!
//! One database per network. Batches go through a single `WriteBatch`, so
//! index entries and the tip record land together or not at all.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{Direction, IteratorMode, Options, ReadOptions, WriteBatch, WriteOptions, DB};

use stampindex_core::error::IndexerError;
use stampindex_core::store::{BatchOp, IndexStore};

/// Directory name of the store inside the network data directory.
pub const STORE_DIR: &str = "stampindex.db";

/// Location of the store for `network` under the node's data directory.
///
/// Mainnet uses the data directory itself; the other networks use the
/// same sub-directories the node does.
pub fn store_path(datadir: impl AsRef<Path>, network: bitcoin::Network) -> PathBuf {
    let datadir = datadir.as_ref();
    let base = match network {
        bitcoin::Network::Bitcoin => datadir.to_path_buf(),
        bitcoin::Network::Testnet => datadir.join("testnet3"),
        bitcoin::Network::Signet => datadir.join("signet"),
        bitcoin::Network::Regtest => datadir.join("regtest"),
        other => datadir.join(other.to_core_arg()),
    };
    base.join(STORE_DIR)
}

/// RocksDB tuning for the index store.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory.
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Write buffer size in bytes (default: 32MB)
    pub write_buffer_size: usize,
    /// Maximum number of write buffers (default: 3)
    pub max_write_buffer_number: i32,
    /// fsync every committed batch (default: true)
    pub sync_writes: bool,
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            write_buffer_size: 32 * 1024 * 1024,
            max_write_buffer_number: 3,
            sync_writes: true,
        }
    }

    /// Small buffers, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024,
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 2,
            sync_writes: false,
            ..Self::new(path)
        }
    }
}

/// Ordered, durable digest index backed by RocksDB.
pub struct RocksStore {
    db: RwLock<Option<DB>>,
    config: RocksConfig,
}

impl RocksStore {
    /// Open (or create) the database at `config.path`, creating parent
    /// directories as needed.
    pub fn open(config: RocksConfig) -> Result<Self, IndexerError> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexerError::Storage(format!("create {}: {e}", parent.display()))
            })?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_block_cache(&rocksdb::Cache::new_lru_cache(config.block_cache_size));
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, &config.path)
            .map_err(|e| IndexerError::Storage(format!("open {}: {e}", config.path.display())))?;
        tracing::info!(path = %config.path.display(), "Opened index store");

        Ok(Self {
            db: RwLock::new(Some(db)),
            config,
        })
    }

    /// Open the store for `network` under the node data directory.
    pub fn open_for_network(
        datadir: impl AsRef<Path>,
        network: bitcoin::Network,
    ) -> Result<Self, IndexerError> {
        Self::open(RocksConfig::new(store_path(datadir, network)))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

fn closed() -> IndexerError {
    IndexerError::Storage("store is closed".into())
}

#[async_trait]
impl IndexStore for RocksStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(closed)?;
        db.get(key)
            .map_err(|e| IndexerError::Storage(format!("get failed: {e}")))
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), IndexerError> {
        // Shared: `DB` serializes writers itself; only `close` needs exclusivity.
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(closed)?;

        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.put(&key, &value),
                BatchOp::Delete { key } => batch.delete(&key),
            }
        }

        db.write_opt(batch, &self.write_options())
            .map_err(|e| IndexerError::Storage(format!("batch write failed: {e}")))
    }

    async fn range(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or_else(closed)?;
        if start >= end {
            return Ok(vec![]);
        }

        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_upper_bound(end.to_vec());

        let mut results = Vec::new();
        for item in db.iterator_opt(IteratorMode::From(start, Direction::Forward), read_opts) {
            let (key, value) =
                item.map_err(|e| IndexerError::Storage(format!("scan failed: {e}")))?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    async fn close(&self) -> Result<(), IndexerError> {
        let Some(db) = self.db.write().take() else {
            return Ok(());
        };
        db.flush()
            .map_err(|e| IndexerError::Storage(format!("flush failed: {e}")))?;
        tracing::info!(path = %self.config.path.display(), "Closed index store");
        Ok(())
    }
}
