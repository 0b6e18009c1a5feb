//! The narrow view of the full node that the indexer
//! and the query layer depend on.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::IndexerError;
use crate::types::{HeaderInfo, TxDetails, UnspentOutput};

/// Capability interface over a co-located full node.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; the indexer and the query
/// handlers share one instance behind an `Arc<dyn NodeClient>`.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Consensus-encoded genesis block.
    async fn genesis_block(&self) -> Result<Vec<u8>, IndexerError> {
        self.raw_block_at(0).await
    }

    /// Consensus-encoded block at `height` on the node's active chain.
    async fn raw_block_at(&self, height: u64) -> Result<Vec<u8>, IndexerError>;

    /// Consensus-encoded block with the given hash.
    async fn raw_block(&self, hash: &str) -> Result<Vec<u8>, IndexerError>;

    /// Header metadata for `hash`, or `None` if the node does not know it.
    async fn block_header(&self, hash: &str) -> Result<Option<HeaderInfo>, IndexerError>;

    /// Height of the node's active chain.
    async fn chain_height(&self) -> Result<u64, IndexerError>;

    /// Returns `true` once the node has caught up with the network.
    async fn is_synced(&self) -> Result<bool, IndexerError>;

    /// Paying address and confirmation time of a transaction.
    async fn transaction_details(&self, txid: &str) -> Result<TxDetails, IndexerError>;

    /// Unspent outputs held by `address`.
    async fn address_unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, IndexerError>;

    /// Broadcast a serialized transaction; returns its txid.
    ///
    /// A node-side refusal is reported as [`IndexerError::Rejected`] with the
    /// node's message unchanged.
    async fn send_transaction(&self, raw_hex: &str) -> Result<String, IndexerError>;

    /// Level-triggered tip notifications carrying the node's chain height.
    fn subscribe_tip(&self) -> watch::Receiver<u64>;
}
