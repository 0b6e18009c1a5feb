//! Test fixtures: a block factory producing real consensus-encoded blocks and
//! a scripted in-process node.
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! downstream crates' tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, TxIn, TxMerkleNode, TxOut,
    Witness,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::IndexerError;
use crate::node::NodeClient;
use crate::types::{HeaderInfo, TxDetails, UnspentOutput};

const BASE_TIME: u32 = 1_600_000_000;

// ─── TestChain ────────────────────────────────────────────────────────────────

/// A linear chain of regtest-style blocks.
///
/// Every mined block carries a coinbase plus one transaction per payload;
/// each of those transactions pays to output 0 and commits its payload in
/// an `OP_RETURN` at output 1.
#[derive(Debug, Clone)]
pub struct TestChain {
    blocks: Vec<bitcoin::Block>,
}

impl TestChain {
    /// A chain holding only a genesis block.
    pub fn new() -> Self {
        let genesis = build_block(BlockHash::all_zeros(), 0, 0, &[]);
        Self {
            blocks: vec![genesis],
        }
    }

    /// Append a block carrying `payloads`.
    pub fn mine(&mut self, payloads: &[&[u8]]) -> bitcoin::Block {
        self.mine_with_nonce(0, payloads)
    }

    /// Append a block; different nonces give competing blocks at one height.
    pub fn mine_with_nonce(&mut self, nonce: u32, payloads: &[&[u8]]) -> bitcoin::Block {
        let height = self.blocks.len() as u64;
        let block = build_block(self.tip().block_hash(), height, nonce, payloads);
        self.blocks.push(block.clone());
        block
    }

    /// Append `count` blocks without payloads.
    pub fn mine_empty(&mut self, count: usize) {
        for _ in 0..count {
            self.mine(&[]);
        }
    }

    /// A copy of this chain truncated to `height` (inclusive), ready to fork.
    pub fn fork_at(&self, height: u64) -> Self {
        Self {
            blocks: self.blocks[..=height as usize].to_vec(),
        }
    }

    pub fn block(&self, height: u64) -> &bitcoin::Block {
        &self.blocks[height as usize]
    }

    pub fn tip(&self) -> &bitcoin::Block {
        self.blocks.last().expect("chain always holds genesis")
    }

    pub fn height(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    pub fn hash(&self, height: u64) -> String {
        self.block(height).block_hash().to_string()
    }

    pub fn blocks(&self) -> &[bitcoin::Block] {
        &self.blocks
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

fn build_block(prev: BlockHash, height: u64, nonce: u32, payloads: &[&[u8]]) -> bitcoin::Block {
    let mut tag = height.to_le_bytes().to_vec();
    tag.extend_from_slice(&nonce.to_le_bytes());

    let mut txdata = vec![transaction(&tag, vec![payment_output()])];
    for (i, payload) in payloads.iter().enumerate() {
        let mut tx_tag = tag.clone();
        tx_tag.push(i as u8);
        txdata.push(transaction(
            &tx_tag,
            vec![payment_output(), data_output(payload)],
        ));
    }

    let mut block = bitcoin::Block {
        header: Header {
            version: BlockVersion::ONE,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: BASE_TIME + height as u32,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce,
        },
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block
}

fn transaction(tag: &[u8], output: Vec<TxOut>) -> bitcoin::Transaction {
    bitcoin::Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(tag.to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}

fn payment_output() -> TxOut {
    TxOut {
        value: Amount::from_sat(5_000),
        // OP_TRUE
        script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
    }
}

/// An `OP_RETURN` output committing `payload`.
pub fn data_output(payload: &[u8]) -> TxOut {
    let push = PushBytesBuf::try_from(payload.to_vec()).expect("payload fits in one push");
    TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(push),
    }
}

// ─── MockNode ─────────────────────────────────────────────────────────────────

/// Scripted in-process node.
///
/// Serves the active chain by height, any block it has ever seen by hash,
/// and canned answers for transaction, address and broadcast calls.
pub struct MockNode {
    active: RwLock<Vec<bitcoin::Block>>,
    known: RwLock<HashMap<String, (u64, bitcoin::Block)>>,
    forgotten: RwLock<HashSet<String>>,
    tx_details: RwLock<HashMap<String, TxDetails>>,
    unspent: RwLock<HashMap<String, Vec<UnspentOutput>>>,
    reject_with: RwLock<Option<String>>,
    broadcasts: Mutex<Vec<String>>,
    synced: AtomicBool,
    fetch_delay: RwLock<Option<Duration>>,
    block_requests: AtomicU64,
    tx_lookup_delay: RwLock<Option<Duration>>,
    tx_lookups_in_flight: AtomicU64,
    tx_lookups_peak: AtomicU64,
    height_tx: watch::Sender<u64>,
}

impl MockNode {
    pub fn new(chain: &TestChain) -> Self {
        let (height_tx, _) = watch::channel(chain.height());
        let node = Self {
            active: RwLock::new(Vec::new()),
            known: RwLock::new(HashMap::new()),
            forgotten: RwLock::new(HashSet::new()),
            tx_details: RwLock::new(HashMap::new()),
            unspent: RwLock::new(HashMap::new()),
            reject_with: RwLock::new(None),
            broadcasts: Mutex::new(Vec::new()),
            synced: AtomicBool::new(true),
            fetch_delay: RwLock::new(None),
            block_requests: AtomicU64::new(0),
            tx_lookup_delay: RwLock::new(None),
            tx_lookups_in_flight: AtomicU64::new(0),
            tx_lookups_peak: AtomicU64::new(0),
            height_tx,
        };
        node.set_chain(chain);
        node
    }

    /// Replace the active chain (a reorg when `chain` forks from the old one).
    /// Blocks of the old chain stay retrievable by hash.
    pub fn set_chain(&self, chain: &TestChain) {
        {
            let mut known = self.known.write();
            for (height, block) in chain.blocks().iter().enumerate() {
                known.insert(block.block_hash().to_string(), (height as u64, block.clone()));
            }
        }
        *self.active.write() = chain.blocks().to_vec();
        self.height_tx.send_replace(chain.height());
    }

    /// Make the node deny all knowledge of a block hash.
    pub fn forget_block(&self, hash: &str) {
        self.forgotten.write().insert(hash.to_string());
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Delay every block fetch, keeping a sync pass busy.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.write() = Some(delay);
    }

    pub fn set_tx_details(&self, details: TxDetails) {
        self.tx_details.write().insert(details.txid.clone(), details);
    }

    pub fn set_unspent(&self, address: &str, outputs: Vec<UnspentOutput>) {
        self.unspent.write().insert(address.to_string(), outputs);
    }

    /// Reject every broadcast with `message`.
    pub fn reject_broadcasts(&self, message: &str) {
        *self.reject_with.write() = Some(message.to_string());
    }

    /// Raw transactions accepted so far.
    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().clone()
    }

    /// Number of block fetches (by height or by hash) served or refused.
    pub fn block_requests(&self) -> u64 {
        self.block_requests.load(Ordering::SeqCst)
    }

    /// Delay every transaction lookup, so concurrent lookups overlap.
    pub fn set_tx_lookup_delay(&self, delay: Duration) {
        *self.tx_lookup_delay.write() = Some(delay);
    }

    /// Most transaction lookups ever in flight at once.
    pub fn peak_tx_lookups(&self) -> u64 {
        self.tx_lookups_peak.load(Ordering::SeqCst)
    }

    async fn before_fetch(&self) {
        self.block_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn raw_block_at(&self, height: u64) -> Result<Vec<u8>, IndexerError> {
        self.before_fetch().await;
        self.active
            .read()
            .get(height as usize)
            .map(bitcoin::consensus::encode::serialize)
            .ok_or_else(|| IndexerError::Node(format!("Block height out of range: {height}")))
    }

    async fn raw_block(&self, hash: &str) -> Result<Vec<u8>, IndexerError> {
        self.before_fetch().await;
        if self.forgotten.read().contains(hash) {
            return Err(IndexerError::Node(format!("Block not found: {hash}")));
        }
        self.known
            .read()
            .get(hash)
            .map(|(_, block)| bitcoin::consensus::encode::serialize(block))
            .ok_or_else(|| IndexerError::Node(format!("Block not found: {hash}")))
    }

    async fn block_header(&self, hash: &str) -> Result<Option<HeaderInfo>, IndexerError> {
        if self.forgotten.read().contains(hash) {
            return Ok(None);
        }
        Ok(self.known.read().get(hash).map(|(height, _)| HeaderInfo {
            hash: hash.to_string(),
            height: *height,
        }))
    }

    async fn chain_height(&self) -> Result<u64, IndexerError> {
        Ok(self.active.read().len().saturating_sub(1) as u64)
    }

    async fn is_synced(&self) -> Result<bool, IndexerError> {
        Ok(self.synced.load(Ordering::SeqCst))
    }

    async fn transaction_details(&self, txid: &str) -> Result<TxDetails, IndexerError> {
        let in_flight = self.tx_lookups_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx_lookups_peak.fetch_max(in_flight, Ordering::SeqCst);
        let delay = *self.tx_lookup_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.tx_lookups_in_flight.fetch_sub(1, Ordering::SeqCst);

        self.tx_details.read().get(txid).cloned().ok_or_else(|| {
            IndexerError::Node(format!(
                "No such mempool or blockchain transaction: {txid}"
            ))
        })
    }

    async fn address_unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, IndexerError> {
        Ok(self.unspent.read().get(address).cloned().unwrap_or_default())
    }

    async fn send_transaction(&self, raw_hex: &str) -> Result<String, IndexerError> {
        if let Some(message) = self.reject_with.read().clone() {
            return Err(IndexerError::Rejected(message));
        }
        self.broadcasts.lock().push(raw_hex.to_string());
        Ok(format!("{:064x}", self.broadcasts.lock().len()))
    }

    fn subscribe_tip(&self) -> watch::Receiver<u64> {
        self.height_tx.subscribe()
    }
}
