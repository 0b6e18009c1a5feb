//! The HTTP listener as a host-managed [`Service`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use stampindex_core::error::IndexerError;
use stampindex_core::service::Service;

use crate::config::ApiConfig;
use crate::query::QueryService;
use crate::router::router;

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Serves the query routes until stopped.
pub struct ApiServer {
    config: ApiConfig,
    query: Arc<QueryService>,
    running: Mutex<Option<Running>>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, query: Arc<QueryService>) -> Self {
        Self {
            config,
            query,
            running: Mutex::new(None),
        }
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }
}

#[async_trait]
impl Service for ApiServer {
    fn name(&self) -> &str {
        "stampindex-api"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["stampindex"]
    }

    fn route_prefix(&self) -> &str {
        &self.config.route_prefix
    }

    async fn start(&self) -> Result<(), IndexerError> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| IndexerError::Other(format!("bind {}: {e}", self.config.listen)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| IndexerError::Other(e.to_string()))?;

        let app = router(self.query.clone(), self.route_prefix());
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = signal.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        });

        tracing::info!(%addr, prefix = %self.config.route_prefix, "Query API listening");
        *self.running.lock() = Some(Running {
            addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexerError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.shutdown.send(());
        running
            .task
            .await
            .map_err(|e| IndexerError::Other(format!("HTTP server task: {e}")))?;
        tracing::info!("Query API stopped");
        Ok(())
    }
}
