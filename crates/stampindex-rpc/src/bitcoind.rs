//! `NodeClient` over bitcoind's JSON-RPC interface.
//!
//! | operation             | RPC                                   |
//! |-----------------------|---------------------------------------|
//! | chain height          | `getblockcount`                       |
//! | block at height       | `getblockhash` + `getblock <hash> 0`  |
//! | block by hash         | `getblock <hash> 0`                   |
//! | header                | `getblockheader <hash> true`          |
//! | sync status           | `getblockchaininfo`                   |
//! | transaction details   | `getrawtransaction <txid> 2`          |
//! | unspent outputs       | `getaddressutxos`                     |
//! | broadcast             | `sendrawtransaction`                  |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use stampindex_core::error::IndexerError;
use stampindex_core::node::NodeClient;
use stampindex_core::types::{HeaderInfo, TxDetails, UnspentOutput};

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::http::HttpTransport;
use crate::transport::RpcTransport;

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: u64,
    headers: u64,
    #[serde(rename = "initialblockdownload")]
    initial_block_download: bool,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    txid: String,
    #[serde(default)]
    vin: Vec<VerboseInput>,
    blocktime: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VerboseInput {
    prevout: Option<Prevout>,
}

#[derive(Debug, Deserialize)]
struct Prevout {
    #[serde(rename = "scriptPubKey")]
    script_pub_key: PrevoutScript,
}

#[derive(Debug, Deserialize)]
struct PrevoutScript {
    address: Option<String>,
}

impl From<VerboseTransaction> for TxDetails {
    fn from(tx: VerboseTransaction) -> Self {
        let source_address = tx
            .vin
            .into_iter()
            .next()
            .and_then(|input| input.prevout)
            .and_then(|prevout| prevout.script_pub_key.address);
        Self {
            txid: tx.txid,
            source_address,
            block_timestamp: tx.blocktime,
        }
    }
}

/// bitcoind-backed [`NodeClient`].
pub struct BitcoindClient<T: RpcTransport = HttpTransport> {
    transport: T,
    next_id: AtomicU64,
    tip: watch::Sender<u64>,
}

impl BitcoindClient<HttpTransport> {
    /// HTTP client for the node described by `config`.
    pub fn from_config(config: &NodeConfig) -> Result<Self, IndexerError> {
        let transport = HttpTransport::new(&config.rpc_url, config.transport())?;
        Ok(Self::new(transport))
    }
}

impl<T: RpcTransport> BitcoindClient<T> {
    pub fn new(transport: T) -> Self {
        let (tip, _) = watch::channel(0);
        Self {
            transport,
            next_id: AtomicU64::new(1),
            tip,
        }
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = self.transport.call(id, method, params).await;
        if let Err(e) = &result {
            tracing::debug!(method, error = %e, url = %self.transport.url(), "RPC call failed");
        }
        result
    }

    async fn block_hash_at(&self, height: u64) -> Result<String, IndexerError> {
        Ok(self.call("getblockhash", vec![json!(height)]).await?)
    }

    /// Poll `getblockcount` every `interval` and publish height changes to
    /// [`NodeClient::subscribe_tip`] receivers.
    pub fn spawn_tip_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match client.chain_height().await {
                    Ok(height) => {
                        let changed = client.tip.send_if_modified(|current| {
                            let changed = *current != height;
                            *current = height;
                            changed
                        });
                        if changed {
                            tracing::debug!(height, "Node tip changed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Tip poll failed"),
                }
            }
        })
    }
}

#[async_trait]
impl<T: RpcTransport> NodeClient for BitcoindClient<T> {
    async fn raw_block_at(&self, height: u64) -> Result<Vec<u8>, IndexerError> {
        let hash = self.block_hash_at(height).await?;
        self.raw_block(&hash).await
    }

    async fn raw_block(&self, hash: &str) -> Result<Vec<u8>, IndexerError> {
        let raw: String = self.call("getblock", vec![json!(hash), json!(0)]).await?;
        hex::decode(&raw).map_err(|e| IndexerError::Decode(format!("block {hash}: {e}")))
    }

    async fn block_header(&self, hash: &str) -> Result<Option<HeaderInfo>, IndexerError> {
        match self
            .call::<HeaderInfo>("getblockheader", vec![json!(hash), json!(true)])
            .await
        {
            Ok(header) => Ok(Some(header)),
            Err(TransportError::Rpc(err)) if err.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn chain_height(&self) -> Result<u64, IndexerError> {
        Ok(self.call("getblockcount", vec![]).await?)
    }

    async fn is_synced(&self) -> Result<bool, IndexerError> {
        let info: BlockchainInfo = self.call("getblockchaininfo", vec![]).await?;
        Ok(!info.initial_block_download && info.blocks >= info.headers)
    }

    async fn transaction_details(&self, txid: &str) -> Result<TxDetails, IndexerError> {
        let tx: VerboseTransaction = self
            .call("getrawtransaction", vec![json!(txid), json!(2)])
            .await?;
        Ok(tx.into())
    }

    async fn address_unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, IndexerError> {
        Ok(self
            .call("getaddressutxos", vec![json!({ "addresses": [address] })])
            .await?)
    }

    async fn send_transaction(&self, raw_hex: &str) -> Result<String, IndexerError> {
        match self.call("sendrawtransaction", vec![json!(raw_hex)]).await {
            Ok(txid) => Ok(txid),
            Err(TransportError::Rpc(err)) => Err(IndexerError::Rejected(err.message)),
            Err(e) => Err(e.into()),
        }
    }

    fn subscribe_tip(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }
}
