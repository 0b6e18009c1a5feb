//! stampindex-core — reorg-safe digest index over a bitcoin full node.
//!
//! # Architecture
//!
//! ```text
//! NodeClient ──tip──▶ ChainIndexer ──batch──▶ IndexStore
//!                         ├── load_tip        (startup, bounded retry)
//!                         ├── sync            (connect / reorg rewind)
//!                         └── EventBus        (added / removed / synced / fatal)
//! ```

pub mod chain;
pub mod error;
pub mod events;
pub mod indexer;
pub mod keys;
pub mod node;
pub mod retry;
pub mod service;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use chain::{ChainIndexer, SyncStatus};
pub use error::IndexerError;
pub use events::{EventBus, IndexerEvent};
pub use indexer::{IndexerConfig, IndexerState};
pub use keys::IndexEntry;
pub use node::NodeClient;
pub use retry::{RetryConfig, RetryPolicy};
pub use service::Service;
pub use store::{BatchOp, IndexStore, MemoryStore};
pub use types::{Block, ChainTip, HeaderInfo, TxDetails, UnspentOutput};
