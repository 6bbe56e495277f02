//! Mirror-mode HTTP side-channel: peers push file blocks here and the hub
//! pins each one, since content bytes are opaque to the gossip/CRDT layer
//! and can be far larger than anything worth round-tripping over the
//! WebSocket protocol.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use log::warn;
use roomsync_core::ContentId;
use serde::{Deserialize, Serialize};

use crate::content_client::ContentClient;
use crate::content_store::ContentStore;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn ContentStore>,
    content_client: Arc<dyn ContentClient>,
}

pub fn router(store: Arc<dyn ContentStore>, content_client: Arc<dyn ContentClient>) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/healthz", get(healthz))
        .with_state(AppState {
            store,
            content_client,
        })
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct Block {
    cid: String,
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    blocks: Vec<Block>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailedBlock {
    cid: String,
    error: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadResponse {
    stored: Vec<String>,
    failed: Vec<FailedBlock>,
}

/// `POST /upload`: base64-decode and store each block, then pin it. A
/// per-block failure (bad base64, store error) doesn't abort the batch —
/// the caller gets back which cids landed and which didn't.
async fn upload(State(state): State<AppState>, Json(req): Json<UploadRequest>) -> Json<UploadResponse> {
    let mut stored = Vec::new();
    let mut failed = Vec::new();

    for block in req.blocks {
        match base64::engine::general_purpose::STANDARD.decode(&block.bytes) {
            Ok(bytes) => {
                let cid = ContentId::new(block.cid.clone());
                match state.store.put(&cid, &bytes).await {
                    Ok(()) => {
                        if let Err(e) = state.content_client.pin(&cid).await {
                            warn!("pin failed for {cid} after upload: {e}");
                        }
                        stored.push(block.cid);
                    }
                    Err(e) => failed.push(FailedBlock {
                        cid: block.cid,
                        error: e.to_string(),
                    }),
                }
            }
            Err(e) => failed.push(FailedBlock {
                cid: block.cid,
                error: format!("invalid base64: {e}"),
            }),
        }
    }

    Json(UploadResponse { stored, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_client::NullContentClient;
    use crate::content_store::SledContentStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> (Arc<dyn ContentStore>, Arc<dyn ContentClient>) {
        let dir = tempfile::tempdir().unwrap();
        (
            Arc::new(SledContentStore::open(dir.path()).unwrap()),
            Arc::new(NullContentClient),
        )
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        assert_eq!(healthz().await, "ok");
    }

    #[tokio::test]
    async fn upload_stores_valid_blocks_and_reports_failures() {
        let (store, client) = state();
        let app = router(store.clone(), client);

        let good_bytes = base64::engine::general_purpose::STANDARD.encode(b"hello");
        let body = serde_json::json!({
            "blocks": [
                {"cid": "bafy-good", "bytes": good_bytes},
                {"cid": "bafy-bad", "bytes": "not valid base64!!"},
            ]
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: UploadResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.stored, vec!["bafy-good".to_string()]);
        assert_eq!(parsed.failed.len(), 1);
        assert_eq!(parsed.failed[0].cid, "bafy-bad");

        let stored_bytes = store.get(&ContentId::new("bafy-good")).await.unwrap().unwrap();
        assert_eq!(stored_bytes, b"hello");
    }
}
