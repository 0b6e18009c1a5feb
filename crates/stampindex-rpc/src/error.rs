//! Transport-level error types.

use thiserror::Error;

use stampindex_core::error::IndexerError;

use crate::request::JsonRpcError;

/// Errors that can occur while talking to the node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, auth, non-JSON body, ...).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Result could not be deserialized into the expected shape.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for IndexerError {
    fn from(err: TransportError) -> Self {
        IndexerError::Node(err.to_string())
    }
}
