//! HTTP surface of the scheduler.
//!
//! Three groups of routes share one [`AppState`]:
//! - open: `/health`, `/metrics`
//! - node-facing: announcements, cache reports, validation reports
//! - operator: archive and validation control, behind `X-API-Key`
//!
//! Archive paths accept either a root CID or its content hash.

use crate::directory::NodeView;
use crate::error::SchedulerError;
use crate::repository::ValidationResultInfo;
use crate::replication::{AdvanceOutcome, ArchiveSnapshot};
use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use common::middleware::{ApiKey, require_api_key};
use common::{
    CacheResult, MAX_VALIDATION_REPORT_BYTES, NodeAnnouncement, ValidationReport, ValidationStatus,
    content_hash_of,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = match &self {
            SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::Unavailable { .. }
            | SchedulerError::NoDownloadSource(_)
            | SchedulerError::DispatchFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::IntegrityViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SchedulerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            SchedulerError::StaleRound { .. }
            | SchedulerError::TaskFinished { .. }
            | SchedulerError::AlreadyFinalized { .. } => StatusCode::CONFLICT,
            SchedulerError::InvalidCid(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Rpc { .. } => StatusCode::BAD_GATEWAY,
            SchedulerError::Corrupt { .. }
            | SchedulerError::Storage(_)
            | SchedulerError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, SchedulerError>;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the scheduler router. Operator routes are only mounted when a
/// write token is configured.
pub fn router(state: Arc<AppState>) -> Router {
    let open = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/nodes/connect", post(connect_node))
        .route("/cache-results", post(cache_result))
        .route(
            "/validation-results",
            post(validation_result).layer(DefaultBodyLimit::max(MAX_VALIDATION_REPORT_BYTES)),
        );

    let Some(token) = state.config.write_token.clone() else {
        warn!("No write token configured, operator routes disabled");
        return open.with_state(state);
    };

    let operator = Router::new()
        .route("/archives", post(register_archive).get(list_archives))
        .route("/archives/{id}", get(get_archive).delete(remove_archive))
        .route("/archives/{id}/advance", post(recache_archive))
        .route(
            "/archives/{id}/nodes/{node_id}",
            post(dispatch_to_node).delete(remove_replica),
        )
        .route("/archives/{id}/expiration", put(reset_expiration))
        .route("/validation/results", get(list_validation_results))
        .route("/validation/enabled", get(validation_enabled).put(set_validation_enabled))
        .route("/validation/rounds", post(start_round))
        .route("/config/candidate-replicas", put(set_candidate_replicas))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{node_id}/assets", get(node_assets))
        .layer(middleware::from_fn_with_state(ApiKey::new(token), require_api_key));

    open.merge(operator).with_state(state)
}

/// Resolve a path segment to an archive content hash. Hex strings are taken
/// as hashes, anything else must parse as a CID.
fn archive_key(id: &str) -> Result<String, SchedulerError> {
    let is_hex = !id.is_empty() && id.len() % 2 == 0 && id.bytes().all(|b| b.is_ascii_hexdigit());
    if is_hex {
        Ok(id.to_ascii_lowercase())
    } else {
        Ok(content_hash_of(id)?)
    }
}

// ============================================================================
// Open routes
// ============================================================================

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub archives_loaded: usize,
    pub nodes: usize,
    pub validation_enabled: bool,
    pub current_round: Option<String>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        archives_loaded: state.replication.record_count(),
        nodes: state.directory.len(),
        validation_enabled: state.validation.is_enabled(),
        current_round: state.validation.current_round().map(|r| r.round_id.clone()),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let output = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        output,
    )
}

// ============================================================================
// Node-facing routes
// ============================================================================

#[derive(Serialize, Deserialize)]
pub struct ConnectResponse {
    pub node: NodeView,
    /// Token edges must present when pulling from this node
    pub access_token: String,
    /// Scheduler's top hash for this node, absent when it holds nothing
    pub asset_top_hash: Option<String>,
    /// Scheduler's per-bucket hashes, for the node to diff against its own
    pub asset_buckets: BTreeMap<u32, String>,
}

async fn connect_node(
    State(state): State<Arc<AppState>>,
    Json(announcement): Json<NodeAnnouncement>,
) -> Json<ConnectResponse> {
    let announced_top = announcement.asset_top_hash.clone();
    let node = state.directory.register(announcement);
    let summary = state.assets.summary_of(&node.node_id);
    let expected_top = summary.as_ref().map(|s| s.top_hash.clone());

    if let Some(announced) = announced_top {
        if Some(&announced) != expected_top.as_ref() {
            warn!(
                node = %node.node_id,
                announced = %announced,
                expected = ?expected_top,
                "Node asset summary diverges from scheduler view"
            );
        }
    }

    let access_token = node.access_token.clone();
    Json(ConnectResponse {
        node,
        access_token,
        asset_top_hash: expected_top,
        asset_buckets: summary.map(|s| s.bucket_hashes).unwrap_or_default(),
    })
}

async fn cache_result(
    State(state): State<Arc<AppState>>,
    Json(result): Json<CacheResult>,
) -> Result<StatusCode, SchedulerError> {
    state.replication.report_completion(result).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize, Deserialize)]
pub struct ValidationAck {
    pub status: ValidationStatus,
}

async fn validation_result(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ValidationReport>,
) -> ApiResult<ValidationAck> {
    let status = state.validation.handle_result(report).await?;
    Ok(Json(ValidationAck { status }))
}

// ============================================================================
// Operator routes
// ============================================================================

#[derive(Serialize, Deserialize)]
pub struct RegisterArchiveRequest {
    pub root_cid: String,
    pub total_size: u64,
    pub total_blocks: u64,
    /// Edge replica target
    pub replicas: usize,
    /// Unix seconds; 0 or absent never expires
    #[serde(default)]
    pub expires_at: u64,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterArchiveResponse {
    pub hash: String,
    /// Outcome of the first advance, absent when it failed
    pub outcome: Option<AdvanceOutcome>,
    pub error: Option<String>,
}

async fn register_archive(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterArchiveRequest>,
) -> ApiResult<RegisterArchiveResponse> {
    let hash = state.replication.register(
        &req.root_cid,
        req.total_size,
        req.total_blocks,
        req.replicas,
        req.expires_at,
    )?;
    // The record exists either way; a failed first advance is retried by
    // the operator or the next converged batch.
    let (outcome, error) = match state.replication.advance(&hash).await {
        Ok(outcome) => (Some(outcome), None),
        Err(e) => {
            warn!(archive = %hash, error = %e, "Initial advance failed");
            (None, Some(e.to_string()))
        }
    };
    Ok(Json(RegisterArchiveResponse { hash, outcome, error }))
}

async fn list_archives(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ArchiveSnapshot>> {
    Ok(Json(state.replication.list()?))
}

async fn get_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ArchiveSnapshot> {
    Ok(Json(state.replication.snapshot(&archive_key(&id)?)?))
}

async fn remove_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, SchedulerError> {
    state.replication.remove(&archive_key(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recache_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AdvanceOutcome> {
    Ok(Json(state.replication.recache(&archive_key(&id)?).await?))
}

async fn dispatch_to_node(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<StatusCode, SchedulerError> {
    state.replication.dispatch_to_node(&archive_key(&id)?, &node_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn remove_replica(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<StatusCode, SchedulerError> {
    state.replication.remove_replica(&archive_key(&id)?, &node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize, Deserialize)]
pub struct ExpirationRequest {
    pub expires_at: u64,
}

async fn reset_expiration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ExpirationRequest>,
) -> Result<StatusCode, SchedulerError> {
    state.replication.reset_expiration(&archive_key(&id)?, req.expires_at)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RoundQuery {
    round: Option<String>,
}

async fn list_validation_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoundQuery>,
) -> ApiResult<Vec<ValidationResultInfo>> {
    Ok(Json(state.validation.list_results(query.round.as_deref())?))
}

#[derive(Serialize, Deserialize)]
pub struct EnabledBody {
    pub enabled: bool,
}

async fn validation_enabled(State(state): State<Arc<AppState>>) -> Json<EnabledBody> {
    Json(EnabledBody {
        enabled: state.validation.is_enabled(),
    })
}

async fn set_validation_enabled(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnabledBody>,
) -> Json<EnabledBody> {
    state.validation.set_enabled(body.enabled);
    Json(body)
}

#[derive(Serialize, Deserialize)]
pub struct RoundStarted {
    pub round_id: String,
    pub seed: u64,
    pub nodes: usize,
}

async fn start_round(State(state): State<Arc<AppState>>) -> ApiResult<RoundStarted> {
    let round = state.validation.start_round().await?;
    info!(round = %round.round_id, "Validation round started by operator");
    Ok(Json(RoundStarted {
        round_id: round.round_id.clone(),
        seed: round.seed,
        nodes: round.node_count(),
    }))
}

#[derive(Serialize, Deserialize)]
pub struct CandidateReplicasBody {
    pub extra: usize,
}

async fn set_candidate_replicas(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CandidateReplicasBody>,
) -> ApiResult<CandidateReplicasBody> {
    state.replication.set_candidate_replica_extra(body.extra)?;
    Ok(Json(CandidateReplicasBody {
        extra: state.replication.candidate_replica_extra(),
    }))
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeView>> {
    Json(state.directory.all_nodes())
}

async fn node_assets(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<BTreeMap<u32, Vec<String>>> {
    if state.directory.get(&node_id).is_none() {
        return Err(SchedulerError::not_found("node", node_id));
    }
    Ok(Json(state.assets.bucket_listing(&node_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::repository::SledRepository;
    use crate::rpc::mock::MockNodeClient;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use common::middleware::API_KEY_HEADER;
    use common::{CacheStatus, NodeRole, cid_of_block};
    use tower::ServiceExt;

    const TOKEN: &str = "operator-key";

    struct TestApp {
        state: Arc<AppState>,
        client: Arc<MockNodeClient>,
        _dir: tempfile::TempDir,
    }

    fn test_app(write_token: Option<&str>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(SledRepository::open(&dir.path().join("db")).unwrap());
        let client = Arc::new(MockNodeClient::default());
        let config = SchedulerConfig {
            write_token: write_token.map(str::to_string),
            validation_enabled: false,
            ..Default::default()
        };
        let state = Arc::new(AppState::new(config, repo, client.clone()).unwrap());
        TestApp {
            state,
            client,
            _dir: dir,
        }
    }

    fn announce(app: &TestApp, id: &str, role: NodeRole) {
        app.state.directory.register(NodeAnnouncement {
            node_id: id.to_string(),
            role,
            rpc_url: format!("http://{id}"),
            validation_addr: None,
            disk_usage: 10.0,
            asset_top_hash: None,
        });
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn empty_request(method: &str, uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let app = test_app(Some(TOKEN));
        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: HealthResponse = body_json(response).await;
        assert_eq!(health.status, "ok");
        assert!(!health.validation_enabled);
    }

    #[tokio::test]
    async fn test_operator_routes_require_key() {
        let app = test_app(Some(TOKEN));
        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/archives", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/archives", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/archives", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_operator_routes_absent_without_token() {
        let app = test_app(None);
        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/archives", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_dispatches_root_and_reports_flow_through() {
        let app = test_app(Some(TOKEN));
        announce(&app, "c_1", NodeRole::Candidate);
        let root = cid_of_block(b"archive root").unwrap().to_string();

        let response = router(app.state.clone())
            .oneshot(json_request(
                "POST",
                "/archives",
                serde_json::json!({
                    "root_cid": root,
                    "total_size": 1024,
                    "total_blocks": 4,
                    "replicas": 1
                }),
                Some(TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let registered: RegisterArchiveResponse = body_json(response).await;
        assert!(registered.error.is_none());
        assert_eq!(app.client.cached_nodes(), vec!["c_1".to_string()]);

        let response = router(app.state.clone())
            .oneshot(json_request(
                "POST",
                "/cache-results",
                serde_json::to_value(CacheResult {
                    archive_hash: registered.hash.clone(),
                    node_id: "c_1".to_string(),
                    status: CacheStatus::Succeeded,
                    done_blocks: 4,
                    done_size: 1024,
                    message: None,
                })
                .unwrap(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Look the archive up by CID rather than hash
        let response = router(app.state.clone())
            .oneshot(empty_request("GET", &format!("/archives/{root}"), Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot: serde_json::Value = body_json(response).await;
        assert_eq!(snapshot["hash"], registered.hash);
        assert_eq!(snapshot["candidate_replicas"], 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = test_app(Some(TOKEN));

        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/archives/1220abcd", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router(app.state.clone())
            .oneshot(empty_request("GET", "/archives/not-a-cid", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(app.state.clone())
            .oneshot(json_request(
                "POST",
                "/validation-results",
                serde_json::to_value(ValidationReport {
                    round_id: "no-such-round".into(),
                    node_id: "e_1".into(),
                    ..Default::default()
                })
                .unwrap(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_full_size_validation_report_is_accepted() {
        let app = test_app(None);
        let cids: Vec<String> = (0..common::MAX_VALIDATION_BLOCKS as u32)
            .map(|i| cid_of_block(&i.to_le_bytes()).unwrap().to_string())
            .collect();
        let report = ValidationReport {
            round_id: "no-such-round".to_string(),
            node_id: "e_1".to_string(),
            cids,
            bandwidth: 1.0,
            cost_time_ms: 1000,
            ..Default::default()
        };
        let body = serde_json::to_value(&report).unwrap();
        assert!(body.to_string().len() > 2 * 1024 * 1024);

        // Reaches the handler, which rejects the round rather than the size
        let response = router(app.state.clone())
            .oneshot(json_request("POST", "/validation-results", body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_connect_returns_token_and_summary() {
        let app = test_app(Some(TOKEN));
        let response = router(app.state.clone())
            .oneshot(json_request(
                "POST",
                "/nodes/connect",
                serde_json::json!({
                    "node_id": "",
                    "role": "Edge",
                    "rpc_url": "http://edge",
                    "disk_usage": 12.5,
                    "asset_top_hash": "00"
                }),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let connected: ConnectResponse = body_json(response).await;
        assert!(connected.node.node_id.starts_with("e_"));
        assert!(!connected.access_token.is_empty());
        assert!(connected.asset_top_hash.is_none());
        assert_eq!(app.state.directory.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_toggle_and_candidate_replicas() {
        let app = test_app(Some(TOKEN));

        let response = router(app.state.clone())
            .oneshot(json_request(
                "PUT",
                "/validation/enabled",
                serde_json::json!({ "enabled": true }),
                Some(TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(app.state.validation.is_enabled());

        let response = router(app.state.clone())
            .oneshot(json_request(
                "PUT",
                "/config/candidate-replicas",
                serde_json::json!({ "extra": 2 }),
                Some(TOKEN),
            ))
            .await
            .unwrap();
        let body: CandidateReplicasBody = body_json(response).await;
        assert_eq!(body.extra, 2);
        assert_eq!(app.state.replication.candidate_floor(), 3);
    }

    #[test]
    fn test_archive_key_accepts_hash_and_cid() {
        let cid = cid_of_block(b"key").unwrap();
        let hash = common::content_hash(&cid);
        assert_eq!(archive_key(&cid.to_string()).unwrap(), hash);
        assert_eq!(archive_key(&hash.to_ascii_uppercase()).unwrap(), hash);
        assert!(archive_key("zz-not-valid").is_err());
    }
}
