//! Shared types for the indexing pipeline.

use std::sync::Arc;

use bitcoin::script::{Instruction, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Largest payload a data-carrier output may push and still be indexed.
pub const MAX_DATA_PAYLOAD: usize = 80;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A decoded block, reduced to what the digest index needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block hash (display hex).
    pub hash: String,
    /// Previous block hash (display hex).
    pub prev_hash: String,
    /// Transactions in block order.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Decode a consensus-encoded block as served by the node.
    pub fn from_raw(raw: &[u8]) -> Result<Self, IndexerError> {
        let block: bitcoin::Block = bitcoin::consensus::encode::deserialize(raw)
            .map_err(|e| IndexerError::Decode(e.to_string()))?;
        Ok(Self::from(&block))
    }

    /// Returns `true` if this block builds directly on `tip`.
    pub fn extends(&self, tip: &ChainTip) -> bool {
        self.prev_hash == tip.hash()
    }
}

impl From<&bitcoin::Block> for Block {
    fn from(block: &bitcoin::Block) -> Self {
        Self {
            hash: block.block_hash().to_string(),
            prev_hash: block.header.prev_blockhash.to_string(),
            transactions: block
                .txdata
                .iter()
                .map(|tx| Transaction {
                    txid: tx.compute_txid().to_string(),
                    outputs: tx
                        .output
                        .iter()
                        .map(|out| TxOutput {
                            script: out.script_pubkey.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// A transaction inside a [`Block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction id (display hex).
    pub txid: String,
    /// Outputs in transaction order.
    pub outputs: Vec<TxOutput>,
}

/// A single transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Locking script.
    pub script: ScriptBuf,
}

impl TxOutput {
    /// Returns the committed payload if this is a data-carrier output.
    ///
    /// A data-carrier script is `OP_RETURN` alone (empty payload) or
    /// `OP_RETURN` followed by exactly one push of at most
    /// [`MAX_DATA_PAYLOAD`] bytes. Anything else is a spend condition.
    pub fn data_payload(&self) -> Option<&[u8]> {
        if !self.script.is_op_return() {
            return None;
        }
        let mut instructions = self.script.instructions();
        instructions.next();
        match (instructions.next(), instructions.next()) {
            (None, _) => Some(&[]),
            (Some(Ok(Instruction::PushBytes(push))), None) if push.len() <= MAX_DATA_PAYLOAD => {
                Some(push.as_bytes())
            }
            _ => None,
        }
    }
}

// ─── ChainTip ─────────────────────────────────────────────────────────────────

/// The head of the locally indexed chain.
#[derive(Debug, Clone)]
pub struct ChainTip {
    /// Height of the tip block.
    pub height: u64,
    /// The full tip block; kept so it can be disconnected on a reorg.
    pub block: Arc<Block>,
}

impl ChainTip {
    pub fn new(height: u64, block: Block) -> Self {
        Self {
            height,
            block: Arc::new(block),
        }
    }

    pub fn hash(&self) -> &str {
        &self.block.hash
    }

    pub fn prev_hash(&self) -> &str {
        &self.block.prev_hash
    }
}

// ─── Node responses ───────────────────────────────────────────────────────────

/// Header metadata returned by the node for a block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    pub hash: String,
    pub height: u64,
}

/// Transaction details used to enrich a digest match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetails {
    pub txid: String,
    /// Address paying the first input, if the node can resolve one.
    pub source_address: Option<String>,
    /// Timestamp of the confirming block.
    pub block_timestamp: Option<i64>,
}

/// An unspent output as reported by the node's address index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnspentOutput {
    pub address: String,
    pub txid: String,
    pub output_index: u32,
    pub script: String,
    pub satoshis: u64,
    pub height: u64,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
