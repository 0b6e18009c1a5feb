//! HTTP binding of [`QueryService`].
//!
//! ```text
//! GET /hash/:digest          200 [StampRecord] | 404 | 500
//! GET /address/:address      200 [UnspentOutput] | 500
//! GET /send/:transaction     200 (empty) | 500 node message
//! ```
//!
//! Every response carries permissive CORS headers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};

use stampindex_core::error::IndexerError;
use stampindex_core::types::UnspentOutput;

use crate::query::{QueryService, StampRecord};

/// Error response of the HTTP layer.
#[derive(Debug)]
pub enum ApiError {
    NotFound,
    Internal(String),
}

impl From<IndexerError> for ApiError {
    fn from(err: IndexerError) -> Self {
        match err {
            // The node's refusal is relayed as-is.
            IndexerError::Rejected(message) => Self::Internal(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

/// CORS policy: any origin, the four verbs clients use, and the usual
/// request headers.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS, Method::PUT])
        .allow_headers([
            header::ORIGIN,
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::ACCEPT,
        ])
}

/// Build the query router, mounted under `prefix` (empty for the root).
/// The leading slash of `prefix` is optional.
pub fn router(query: Arc<QueryService>, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/hash/:digest", get(lookup_hash))
        .route("/address/:address", get(address_data))
        .route("/send/:transaction", get(send_transaction))
        .with_state(query);

    let prefix = prefix.trim_matches('/');
    let app = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&format!("/{prefix}"), routes)
    };
    app.layer(cors_layer())
}

async fn lookup_hash(
    State(query): State<Arc<QueryService>>,
    Path(digest): Path<String>,
) -> Result<Json<Vec<StampRecord>>, ApiError> {
    tracing::info!(%digest, "Digest lookup");
    match query.lookup_digest(&digest).await {
        Ok(Some(records)) => Ok(Json(records)),
        Ok(None) => Err(ApiError::NotFound),
        Err(e) => {
            tracing::error!(%digest, error = %e, "Digest lookup failed");
            Err(e.into())
        }
    }
}

async fn address_data(
    State(query): State<Arc<QueryService>>,
    Path(address): Path<String>,
) -> Result<Json<Vec<UnspentOutput>>, ApiError> {
    Ok(Json(query.address_unspent(&address).await?))
}

async fn send_transaction(
    State(query): State<Arc<QueryService>>,
    Path(transaction): Path<String>,
) -> Result<StatusCode, ApiError> {
    query.broadcast(&transaction).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use stampindex_core::keys::IndexEntry;
    use stampindex_core::store::{BatchOp, IndexStore, MemoryStore};
    use stampindex_core::testing::{MockNode, TestChain};
    use stampindex_core::types::TxDetails;
    use stampindex_core::{ChainIndexer, IndexerConfig, SyncStatus};
    use tower::ServiceExt;

    async fn app(prefix: &str) -> (Router, Arc<MockNode>) {
        let store = Arc::new(MemoryStore::new());
        let entry = IndexEntry {
            digest: "deadbeef".into(),
            height: 10,
            txid: "tx1".into(),
            output_index: 2,
            block_hash: "abc123".into(),
        };
        store
            .write_batch(vec![BatchOp::put(entry.key(), entry.value())])
            .await
            .unwrap();

        let node = Arc::new(MockNode::new(&TestChain::new()));
        node.set_tx_details(TxDetails {
            txid: "tx1".into(),
            source_address: Some("mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef".into()),
            block_timestamp: Some(1_600_000_010),
        });
        let query = Arc::new(QueryService::new(store, node.clone()));
        (router(query, prefix), node)
    }

    async fn get_path(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn hash_lookup_returns_records() {
        let (app, _node) = app("").await;
        let resp = get_path(app, "/hash/deadbeef").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "hash": "abc123",
                "height": 10,
                "txid": "tx1",
                "outputIndex": 2,
                "sourceAddress": "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef",
                "timestamp": 1_600_000_010
            }])
        );
    }

    #[tokio::test]
    async fn upper_case_digest_is_normalized() {
        let (app, _node) = app("").await;
        assert_eq!(get_path(app, "/hash/DEADBEEF").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_digest_is_404() {
        let (app, _node) = app("").await;
        let resp = get_path(app, "/hash/deadbeef00").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_hex_digest_is_404() {
        let (app, _node) = app("").await;
        for uri in ["/hash/abc", "/hash/xyz", "/hash/deadbee", "/hash/not-hex"] {
            assert_eq!(
                get_path(app.clone(), uri).await.status(),
                StatusCode::NOT_FOUND,
                "{uri}"
            );
        }
    }

    #[tokio::test]
    async fn responses_carry_cors_headers() {
        let (app, _node) = app("").await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/hash/deadbeef")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn preflight_lists_methods_and_headers() {
        let (app, _node) = app("").await;
        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/send/0100")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let methods = resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        for method in ["GET", "POST", "PUT", "OPTIONS"] {
            assert!(methods.contains(method), "{methods}");
        }
        let headers = resp
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(headers.contains("x-requested-with"));
        assert!(headers.contains("content-type"));
    }

    #[tokio::test]
    async fn send_accepts_and_relays_rejection() {
        let (app, node) = app("").await;
        let resp = get_path(app.clone(), "/send/0100abcd").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp).await.is_empty());
        assert_eq!(node.broadcasts(), vec!["0100abcd".to_string()]);

        node.reject_broadcasts("bad-txns-inputs-missingorspent");
        let resp = get_path(app, "/send/0100abcd").await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(resp).await, "bad-txns-inputs-missingorspent");
    }

    #[tokio::test]
    async fn address_passes_through() {
        let (app, node) = app("").await;
        node.set_unspent(
            "maddr",
            vec![UnspentOutput {
                address: "maddr".into(),
                txid: "tx9".into(),
                output_index: 0,
                script: "76a914".into(),
                satoshis: 15_000,
                height: 345,
            }],
        );
        let resp = get_path(app, "/address/maddr").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(json[0]["satoshis"], 15_000);
        assert_eq!(json[0]["outputIndex"], 0);
    }

    #[tokio::test]
    async fn routes_mount_under_prefix() {
        let (app, _node) = app("/stamp/").await;
        assert_eq!(
            get_path(app.clone(), "/stamp/hash/deadbeef").await.status(),
            StatusCode::OK
        );
        assert_eq!(
            get_path(app, "/hash/deadbeef").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn prefix_without_leading_slash_is_mounted() {
        let (app, _node) = app("stampingservice").await;
        assert_eq!(
            get_path(app, "/stampingservice/hash/deadbeef").await.status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn indexed_block_is_served_over_http() {
        let mut chain = TestChain::new();
        chain.mine_empty(2);
        chain.mine(&[&[0xde, 0xad, 0xbe, 0xef]]);
        let stamped = chain.block(3).clone();
        let txid = stamped.txdata[1].compute_txid().to_string();

        let store = Arc::new(MemoryStore::new());
        let node = Arc::new(MockNode::new(&chain));
        node.set_tx_details(TxDetails {
            txid: txid.clone(),
            source_address: Some("mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef".into()),
            block_timestamp: Some(i64::from(stamped.header.time)),
        });

        let indexer = ChainIndexer::new(IndexerConfig::default(), store.clone(), node.clone());
        indexer.load_tip().await.unwrap();
        assert_eq!(
            indexer.sync().await.unwrap(),
            SyncStatus::Completed { height: 3, synced: true }
        );

        let app = router(Arc::new(QueryService::new(store, node)), "");
        let resp = get_path(app, "/hash/DEADBEEF").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{
                "hash": chain.hash(3),
                "height": 3,
                "txid": txid,
                "outputIndex": 1,
                "sourceAddress": "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef",
                "timestamp": stamped.header.time
            }])
        );
    }
}
