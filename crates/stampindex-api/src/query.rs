//! Digest, address and broadcast queries, independent of any HTTP framework.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use stampindex_core::error::IndexerError;
use stampindex_core::keys::{digest_range, IndexEntry};
use stampindex_core::node::NodeClient;
use stampindex_core::store::IndexStore;
use stampindex_core::types::UnspentOutput;

/// One on-chain commitment of a digest, enriched with node data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StampRecord {
    /// Hash of the block that carried the commitment.
    pub hash: String,
    pub height: u64,
    pub txid: String,
    pub output_index: u32,
    pub source_address: Option<String>,
    pub timestamp: Option<i64>,
}

/// Default cap on concurrent transaction lookups for one digest query.
pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 8;

/// Lower-case `digest`; `None` if it is not non-empty hex and so can never
/// have been indexed.
pub fn normalize_digest(digest: &str) -> Option<String> {
    let digest = digest.trim().to_ascii_lowercase();
    if digest.is_empty() || hex::decode(&digest).is_err() {
        return None;
    }
    Some(digest)
}

/// Every index entry for `digest`, ordered by (height, txid, output index).
pub async fn scan_digest(
    store: &dyn IndexStore,
    digest: &str,
) -> Result<Vec<IndexEntry>, IndexerError> {
    let Some(digest) = normalize_digest(digest) else {
        return Ok(Vec::new());
    };
    let (start, end) = digest_range(&digest);

    let mut entries = store
        .range(&start, &end)
        .await?
        .iter()
        .map(|(key, value)| IndexEntry::decode(key, value))
        .collect::<Result<Vec<_>, _>>()?;
    // Heights are unpadded in keys, so byte order is not chronological.
    entries.sort_by(|a, b| {
        (a.height, &a.txid, a.output_index).cmp(&(b.height, &b.txid, b.output_index))
    });
    Ok(entries)
}

/// Read side of stampindex: the digest index plus node pass-throughs.
pub struct QueryService {
    store: Arc<dyn IndexStore>,
    node: Arc<dyn NodeClient>,
    max_concurrent_lookups: usize,
}

impl QueryService {
    pub fn new(store: Arc<dyn IndexStore>, node: Arc<dyn NodeClient>) -> Self {
        Self {
            store,
            node,
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
        }
    }

    /// Limit how many transaction lookups one digest query keeps in flight.
    pub fn with_max_concurrent_lookups(mut self, limit: usize) -> Self {
        self.max_concurrent_lookups = limit.max(1);
        self
    }

    /// Index entries for `digest`, oldest first, without touching the node.
    pub async fn entries(&self, digest: &str) -> Result<Vec<IndexEntry>, IndexerError> {
        scan_digest(self.store.as_ref(), digest).await
    }

    /// Every commitment of `digest`, or `None` if it was never stamped.
    ///
    /// Each match is enriched with the paying address and block time, at
    /// most `max_concurrent_lookups` at a time and in index order; one failed
    /// lookup fails the whole answer.
    pub async fn lookup_digest(
        &self,
        digest: &str,
    ) -> Result<Option<Vec<StampRecord>>, IndexerError> {
        let entries = self.entries(digest).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let records: Vec<StampRecord> = stream::iter(entries)
            .map(|entry| async move {
                tracing::debug!(txid = %entry.txid, "Fetching transaction details");
                let details = self.node.transaction_details(&entry.txid).await?;
                Ok::<_, IndexerError>(StampRecord {
                    hash: entry.block_hash,
                    height: entry.height,
                    txid: entry.txid,
                    output_index: entry.output_index,
                    source_address: details.source_address,
                    timestamp: details.block_timestamp,
                })
            })
            .buffered(self.max_concurrent_lookups)
            .try_collect()
            .await?;
        Ok(Some(records))
    }

    /// Unspent outputs of `address`, straight from the node.
    pub async fn address_unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, IndexerError> {
        let outputs = self.node.address_unspent(address).await?;
        tracing::info!(%address, outputs = outputs.len(), "Address data");
        Ok(outputs)
    }

    /// Relay a serialized transaction to the node. Never retried.
    pub async fn broadcast(&self, raw_hex: &str) -> Result<String, IndexerError> {
        match self.node.send_transaction(raw_hex).await {
            Ok(txid) => {
                tracing::info!(%txid, "Transaction broadcast");
                Ok(txid)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error sending transaction");
                Err(e)
            }
        }
    }
}
