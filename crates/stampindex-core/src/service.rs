//! Service capability trait implemented by long-running components.

use async_trait::async_trait;

use crate::error::IndexerError;

/// A component the host starts, stops and mounts routes for.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable service name, used in logs.
    fn name(&self) -> &str;

    /// Names of the upstream capabilities this service needs running first.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Path prefix under which the host mounts this service's routes.
    fn route_prefix(&self) -> &str {
        ""
    }

    async fn start(&self) -> Result<(), IndexerError>;

    async fn stop(&self) -> Result<(), IndexerError>;
}
