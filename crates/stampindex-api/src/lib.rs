//! stampindex-api — query surface of stampindex.
//!
//! [`QueryService`] answers digest, address and broadcast requests;
//! [`router`] binds it to HTTP with `axum`, and [`ApiServer`] runs that
//! router as a host-managed service.

pub mod config;
pub mod query;
pub mod router;
pub mod server;

pub use config::ApiConfig;
pub use query::{
    normalize_digest, scan_digest, QueryService, StampRecord, DEFAULT_MAX_CONCURRENT_LOOKUPS,
};
pub use router::{cors_layer, router, ApiError};
pub use server::ApiServer;
