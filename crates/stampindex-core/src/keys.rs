//! Key layout of the persistent index.
//!
//! Two key families share one ordered keyspace:
//!
//! ```text
//! 0x04                                      -> tip block hash (32 raw bytes)
//! 0xff-{digest}-{height}-{txid}-{vout}      -> block hash (hex)
//! ```
//!
//! A digest lookup scans `[0xff-{digest}-, 0xff-{digest}-~)`. `~` sorts after
//! every character that can follow the separator, so the range holds exactly
//! the entries of one digest and never those of a longer digest sharing its
//! prefix.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::Block;

/// Reserved key holding the tip record.
pub const TIP_KEY: &[u8] = &[0x04];

/// Marker byte that opens every digest index key.
pub const INDEX_MARKER: u8 = 0xff;

/// Separator between key components.
pub const SEPARATOR: u8 = b'-';

/// Exclusive upper-bound sentinel for digest range scans.
pub const SENTINEL: u8 = b'~';

/// One qualifying output observed in one connected block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Hex-encoded payload of the data output.
    pub digest: String,
    pub height: u64,
    pub txid: String,
    pub output_index: u32,
    /// Hash of the block that carried the output.
    pub block_hash: String,
}

impl IndexEntry {
    /// Encode the store key for this entry.
    pub fn key(&self) -> Vec<u8> {
        let mut key = digest_prefix(&self.digest);
        key.extend_from_slice(
            format!(
                "{}{}{}{}{}",
                self.height, SEPARATOR as char, self.txid, SEPARATOR as char, self.output_index
            )
            .as_bytes(),
        );
        key
    }

    /// Encode the store value for this entry.
    pub fn value(&self) -> Vec<u8> {
        self.block_hash.as_bytes().to_vec()
    }

    /// Decode an entry from a stored key/value pair.
    pub fn decode(key: &[u8], value: &[u8]) -> Result<Self, IndexerError> {
        let malformed = || IndexerError::Storage(format!("malformed index key {}", hex::encode(key)));

        let rest = key
            .strip_prefix(&[INDEX_MARKER, SEPARATOR])
            .ok_or_else(malformed)?;
        let rest = std::str::from_utf8(rest).map_err(|_| malformed())?;

        let mut parts = rest.splitn(4, SEPARATOR as char);
        let digest = parts.next().ok_or_else(malformed)?;
        let height = parts.next().and_then(|h| h.parse().ok()).ok_or_else(malformed)?;
        let txid = parts.next().ok_or_else(malformed)?;
        let output_index = parts.next().and_then(|i| i.parse().ok()).ok_or_else(malformed)?;

        let block_hash = String::from_utf8(value.to_vec())
            .map_err(|_| IndexerError::Storage("index value is not utf-8".into()))?;

        Ok(Self {
            digest: digest.to_string(),
            height,
            txid: txid.to_string(),
            output_index,
            block_hash,
        })
    }
}

/// `{marker}-{digest}-`: the common prefix of every entry for `digest`.
pub fn digest_prefix(digest: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(digest.len() + 3);
    key.push(INDEX_MARKER);
    key.push(SEPARATOR);
    key.extend_from_slice(digest.as_bytes());
    key.push(SEPARATOR);
    key
}

/// Half-open `[start, end)` key range holding every entry for `digest`.
pub fn digest_range(digest: &str) -> (Vec<u8>, Vec<u8>) {
    let start = digest_prefix(digest);
    let mut end = start.clone();
    end.push(SENTINEL);
    (start, end)
}

/// All index entries a block contributes at `height`, in block order.
///
/// Connect writes exactly these keys and disconnect deletes exactly these
/// keys, so both sides always agree on a block's footprint.
pub fn block_entries(block: &Block, height: u64) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    for tx in &block.transactions {
        for (output_index, output) in tx.outputs.iter().enumerate() {
            let Some(payload) = output.data_payload() else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }
            let digest = hex::encode(payload);
            tracing::debug!(%digest, txid = %tx.txid, output_index, "data output");
            entries.push(IndexEntry {
                digest,
                height,
                txid: tx.txid.clone(),
                output_index: output_index as u32,
                block_hash: block.hash.clone(),
            });
        }
    }
    entries
}

/// Encode a block hash for the tip record.
pub fn encode_tip(hash: &str) -> Result<Vec<u8>, IndexerError> {
    hex::decode(hash).map_err(|e| IndexerError::Decode(format!("tip hash {hash}: {e}")))
}

/// Decode the tip record back into a block hash.
pub fn decode_tip(value: &[u8]) -> String {
    hex::encode(value)
}
