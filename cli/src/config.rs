//! Daemon configuration: TOML file, then flag / environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use stampindex_api::ApiConfig;
use stampindex_core::IndexerConfig;
use stampindex_rpc::NodeConfig;

use crate::logging::LogConfig;

/// Everything the daemon needs, one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub node: NodeConfig,
    pub indexer: IndexerConfig,
    pub api: ApiConfig,
    pub log: LogConfig,
}

/// Command-line / environment values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub datadir: Option<PathBuf>,
    pub network: Option<String>,
    pub rpc_url: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub listen: Option<String>,
    pub log_level: Option<String>,
    pub log_json: bool,
}

impl DaemonConfig {
    /// Parse a TOML document; missing sections and keys take defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(datadir) = &overrides.datadir {
            self.node.datadir = datadir.clone();
        }
        if let Some(network) = &overrides.network {
            self.node.network = network.clone();
        }
        if let Some(url) = &overrides.rpc_url {
            self.node.rpc_url = url.clone();
        }
        if let Some(user) = &overrides.rpc_user {
            self.node.rpc_user = Some(user.clone());
        }
        if let Some(password) = &overrides.rpc_password {
            self.node.rpc_password = Some(password.clone());
        }
        if let Some(listen) = &overrides.listen {
            self.api.listen = listen.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.log.level = level.clone();
        }
        if overrides.log_json {
            self.log.json = true;
        }
    }
}
