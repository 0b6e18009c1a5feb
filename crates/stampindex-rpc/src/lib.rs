//! stampindex-rpc — the bitcoind side of stampindex.
//!
//! Modules:
//! - [`request`] — JSON-RPC wire types
//! - [`transport`] — the `RpcTransport` trait
//! - [`http`] — `reqwest` transport with basic auth
//! - [`bitcoind`] — `NodeClient` implementation and tip poller
//! - [`config`] — `NodeConfig`

pub mod bitcoind;
pub mod config;
pub mod error;
pub mod http;
pub mod request;
pub mod transport;

pub use bitcoind::BitcoindClient;
pub use config::NodeConfig;
pub use error::TransportError;
pub use http::{HttpTransport, HttpTransportConfig};
pub use transport::RpcTransport;
