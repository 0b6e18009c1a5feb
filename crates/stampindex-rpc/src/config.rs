//! Node connection settings.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stampindex_core::error::IndexerError;

use crate::http::HttpTransportConfig;

/// How to reach the co-located bitcoind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// RPC endpoint URL.
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// Node data directory; the index store lives under it.
    pub datadir: PathBuf,
    /// `bitcoin`, `testnet`, `signet` or `regtest` (node-style `main` and
    /// `test` are accepted too).
    pub network: String,
    /// Per-request timeout (milliseconds).
    pub request_timeout_ms: u64,
    /// How often the tip poller asks for the chain height (milliseconds).
    pub tip_poll_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".into(),
            rpc_user: None,
            rpc_password: None,
            datadir: PathBuf::from("./data"),
            network: "bitcoin".into(),
            request_timeout_ms: 30_000,
            tip_poll_interval_ms: 1_000,
        }
    }
}

impl NodeConfig {
    pub fn network(&self) -> Result<bitcoin::Network, IndexerError> {
        bitcoin::Network::from_str(&self.network)
            .ok()
            .or_else(|| bitcoin::Network::from_core_arg(&self.network).ok())
            .ok_or_else(|| IndexerError::Other(format!("unknown network '{}'", self.network)))
    }

    pub fn tip_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tip_poll_interval_ms)
    }

    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            user: self.rpc_user.clone(),
            password: self.rpc_password.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_names() {
        let mut cfg = NodeConfig::default();
        assert_eq!(cfg.network().unwrap(), bitcoin::Network::Bitcoin);
        cfg.network = "testnet".into();
        assert_eq!(cfg.network().unwrap(), bitcoin::Network::Testnet);
        cfg.network = "main".into();
        assert_eq!(cfg.network().unwrap(), bitcoin::Network::Bitcoin);
        cfg.network = "moonnet".into();
        assert!(cfg.network().is_err());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{"rpc_url": "http://node:18332", "network": "regtest"}"#)
                .unwrap();
        assert_eq!(cfg.rpc_url, "http://node:18332");
        assert_eq!(cfg.tip_poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.transport().request_timeout, Duration::from_secs(30));
    }
}
