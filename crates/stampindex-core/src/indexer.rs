//! Indexer configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Configuration for a [`ChainIndexer`](crate::chain::ChainIndexer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Attempts at resolving the persisted tip on startup before giving up.
    pub tip_retry_attempts: u32,
    /// Delay between startup tip resolution attempts (milliseconds).
    pub tip_retry_interval_ms: u64,
    /// Consecutive disconnects allowed in one sync pass before the pass is
    /// aborted as fatal.
    pub max_reorg_depth: u64,
    /// How often `stop` re-checks the in-progress flag (milliseconds).
    pub stop_poll_interval_ms: u64,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            tip_retry_attempts: 3,
            tip_retry_interval_ms: 60_000,
            max_reorg_depth: 100,
            stop_poll_interval_ms: 10,
            event_capacity: 1024,
        }
    }
}

impl IndexerConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.tip_retry_attempts,
            interval: Duration::from_millis(self.tip_retry_interval_ms),
        }
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Constructed, `start` not yet called.
    Uninitialized,
    /// Reading the tip record and resolving it against the node.
    LoadingTip,
    /// Tip established, no sync pass running.
    Idle,
    /// A sync pass is running.
    Syncing,
    /// Stop requested; waiting for the active pass to drain.
    Stopping,
    /// Store closed.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::LoadingTip => write!(f, "loading-tip"),
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
