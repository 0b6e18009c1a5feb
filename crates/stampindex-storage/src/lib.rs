//! stampindex-storage — persistent backend for the stampindex digest index.
//!
//! [`rocks`] — RocksDB, one database per network under the node data
//! directory. The in-memory store used by tests lives in `stampindex-core`.

pub mod rocks;

pub use rocks::{store_path, RocksConfig, RocksStore, STORE_DIR};
