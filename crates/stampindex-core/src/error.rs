//! Error types for the stampindex pipeline.

use thiserror::Error;

/// Errors that can occur while indexing, querying or talking to the node.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("node error: {0}")]
    Node(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("block decode error: {0}")]
    Decode(String),

    #[error("node does not have our tip {hash} after {attempts} attempts; reindex required")]
    TipUnavailable { hash: String, attempts: u32 },

    #[error("could not resolve height for tip {hash}")]
    TipHeightUnknown { hash: String },

    #[error("reorg deeper than {max_depth} blocks at height {height}")]
    ReorgTooDeep { height: u64, max_depth: u64 },

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the indexer cannot continue and an operator has to step in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::TipUnavailable { .. }
                | Self::TipHeightUnknown { .. }
                | Self::ReorgTooDeep { .. }
        )
    }
}
