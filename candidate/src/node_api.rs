//! HTTP surface a storage node exposes to the scheduler.
//!
//! Endpoints:
//! - POST /validate - Start streaming for a validation challenge
//! - DELETE /validate - Cancel the active validation stream
//! - POST /blocks-of-asset - Referee derivation of a sampled block sequence
//! - DELETE /archives/{root_cid} - Drop a cached archive
//! - GET /health - Health check

use crate::responder::Responder;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use carstore::{IndexedArchiveCache, StoreError};
use common::{BlocksOfAssetRequest, MAX_VALIDATION_BLOCKS, ValidationChallenge, content_hash, parse_cid};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct NodeState {
    pub cache: Arc<IndexedArchiveCache>,
    pub responder: Arc<Responder>,
    /// Cancellation handle of the stream in progress
    active: Mutex<Option<CancellationToken>>,
}

impl NodeState {
    pub fn new(cache: Arc<IndexedArchiveCache>, responder: Arc<Responder>) -> Self {
        Self {
            cache,
            responder,
            active: Mutex::new(None),
        }
    }

    /// Install a token for a new stream, cancelling any previous one.
    fn begin_stream(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.active.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel the active stream. Returns whether one was running.
    pub fn cancel_stream(&self) -> bool {
        match self.active.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub cached_archives: usize,
}

/// POST /validate - Stream sampled blocks to the validator in the background.
pub async fn validate(
    State(state): State<Arc<NodeState>>,
    Json(challenge): Json<ValidationChallenge>,
) -> impl IntoResponse {
    let token = state.begin_stream();
    let responder = state.responder.clone();
    info!(
        round = %challenge.round_id,
        validator = %challenge.validator_addr,
        "Validation challenge received"
    );
    tokio::spawn(async move {
        if let Err(e) = responder.respond(&challenge, token).await {
            warn!(round = %challenge.round_id, error = %e, "Validation response failed");
        }
    });
    StatusCode::ACCEPTED
}

/// DELETE /validate - Cancel the running validation stream.
pub async fn cancel_validate(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    if state.cancel_stream() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

/// POST /blocks-of-asset - Derive the block CIDs for draws `0..count`.
pub async fn blocks_of_asset(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<BlocksOfAssetRequest>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    if req.count > MAX_VALIDATION_BLOCKS {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("count {} exceeds {MAX_VALIDATION_BLOCKS}", req.count),
        ));
    }
    let root = parse_cid(&req.root_cid).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let cache = state.cache.clone();
    let blocks = tokio::task::spawn_blocking(move || cache.blocks_of_asset(&root, req.seed, req.count))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match blocks {
        Ok(cids) => {
            debug!(root = %req.root_cid, count = cids.len(), "Derived referee blocks");
            Ok(Json(cids.iter().map(|c| c.to_string()).collect()))
        }
        Err(e) if e.is_not_found() => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ StoreError::EmptyArchive(_)) => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// DELETE /archives/{root_cid} - Evict and delete an archive.
pub async fn delete_archive(
    State(state): State<Arc<NodeState>>,
    Path(root_cid): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let root = parse_cid(&root_cid).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    state.cache.remove(&root);
    match state.cache.dir().remove(&content_hash(&root)) {
        Ok(true) => {
            info!(root = %root_cid, "Archive deleted");
            Ok(StatusCode::OK)
        }
        Ok(false) => Ok(StatusCode::NOT_FOUND),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// GET /health - Health check endpoint.
pub async fn health(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    let cached_archives = state.cache.dir().list().map(|l| l.len()).unwrap_or(0);
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.responder.node_id().to_string(),
        cached_archives,
    })
}

pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/validate", post(validate).delete(cancel_validate))
        .route("/blocks-of-asset", post(blocks_of_asset))
        .route("/archives/{root_cid}", delete(delete_archive))
        .route("/health", get(health))
        .with_state(state)
}
