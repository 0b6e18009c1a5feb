//! HTTP JSON-RPC transport backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcTransport;

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP transport to bitcoind's RPC port, with basic auth.
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, config: HttpTransportConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            config,
        })
    }

    fn timeout_ms(&self) -> u64 {
        self.config.request_timeout.as_millis() as u64
    }
}

/// Interpret a bitcoind HTTP reply.
///
/// bitcoind reports RPC failures with a non-2xx status and a regular
/// JSON-RPC body, so the body is decoded before the status is judged.
pub(crate) fn decode_body(status: u16, body: &str) -> Result<JsonRpcResponse, TransportError> {
    let success = (200..300).contains(&status);
    let http_error = || TransportError::Http(format!("HTTP {status}: {}", body.trim()));
    match serde_json::from_str::<JsonRpcResponse>(body) {
        Ok(resp) if success || resp.error.is_some() => Ok(resp),
        Ok(_) => Err(http_error()),
        Err(_) if !success => Err(http_error()),
        Err(e) => Err(TransportError::Deserialization(e)),
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let mut builder = self.http.post(&self.url).json(&req);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_ref());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    ms: self.timeout_ms(),
                }
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        tracing::trace!(method = %req.method, status, "RPC reply");
        decode_body(status, &body)
    }

    fn url(&self) -> &str {
        &self.url
    }
}
