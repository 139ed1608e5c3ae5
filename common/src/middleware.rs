//! HTTP middleware shared by the scheduler and node services.
//!
//! Operator routes are protected with an `X-API-Key` header. The expected key
//! is carried in router state so tests and multiple services in one process
//! can use different keys.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Header name for API key authentication.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Expected API key for a router.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Arc::from(key.into()))
    }

    /// Constant-time comparison against a provided key. Length may leak.
    pub fn matches(&self, provided: &str) -> bool {
        let expected = self.0.as_bytes();
        let provided = provided.as_bytes();
        expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
    }
}

/// Reject requests whose `X-API-Key` header is missing or wrong.
///
/// ```ignore
/// let operator = Router::new()
///     .route("/archives", post(register_archive))
///     .layer(middleware::from_fn_with_state(api_key, require_api_key));
/// ```
pub async fn require_api_key(
    State(expected): State<ApiKey>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(key) if expected.matches(key) => Ok(next.run(request).await),
        Some(_) => {
            warn!(path = %request.uri().path(), "Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!(path = %request.uri().path(), "No API key provided in {} header", API_KEY_HEADER);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
