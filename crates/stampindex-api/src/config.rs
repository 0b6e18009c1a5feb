//! HTTP listener settings.

use serde::{Deserialize, Serialize};

use crate::query::DEFAULT_MAX_CONCURRENT_LOOKUPS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Socket address to listen on.
    pub listen: String,
    /// Path prefix for every route; empty mounts them at the root.
    pub route_prefix: String,
    /// Transaction lookups one digest query may keep in flight against the
    /// node. Keep it below bitcoind's `rpcworkqueue`.
    pub max_concurrent_lookups: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3001".into(),
            route_prefix: String::new(),
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
        }
    }
}
