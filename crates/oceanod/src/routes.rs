//! HTTP surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::search::{SearchError, SearchHit};
use crate::state::AppState;

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>, thumbs_dir: &Path) -> Router {
    Router::new()
        .route("/search", post(search))
        .route("/healthz", get(healthz))
        .route("/health", get(health))
        .route("/status", get(status))
        .nest_service("/thumbs", ServeDir::new(thumbs_dir))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct SearchResponse {
    items: Vec<SearchHit>,
    elapsed_ms: u64,
}

/// POST /search: raw image bytes in, ranked matches out.
async fn search(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if state.is_shutting_down() {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", "server is shutting down")
            .into_response();
    }
    let start = Instant::now();
    match tokio::time::timeout(state.request_timeout, state.pipeline.search_bytes(body.to_vec())).await {
        Ok(Ok(items)) => Json(SearchResponse {
            items,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
        .into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(_) => {
            tracing::warn!(timeout_s = state.request_timeout.as_secs(), "search request timed out");
            error_body(StatusCode::GATEWAY_TIMEOUT, "timeout", "request timed out").into_response()
        }
    }
}

/// GET /healthz: liveness.
async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

/// GET /health: readiness, with the individual checks.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    state.set_index_healthy(state.index.count().await.is_ok());
    let readiness = state.readiness();
    let code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(readiness)).into_response()
}

/// GET /status: collection size, model and ledger state.
async fn status(State(state): State<Arc<AppState>>) -> Response {
    let vectors = match state.index.count().await {
        Ok(n) => n,
        Err(e) => {
            return error_body(StatusCode::BAD_GATEWAY, "index", &e.to_string()).into_response();
        }
    };
    let ledger = match &state.ledger {
        Some(ledger) => ledger.counts().await.ok(),
        None => None,
    };
    Json(json!({
        "collection": state.index.collection(),
        "vectors": vectors,
        "model": state.resource.stats(),
        "ledger": ledger,
    }))
    .into_response()
}

fn error_body(code: StatusCode, kind: &str, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (code, Json(json!({ "error": message, "kind": kind })))
}

impl IntoResponse for SearchError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match &self {
            SearchError::Busy { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                let mut resp = error_body(StatusCode::SERVICE_UNAVAILABLE, "busy", &message).into_response();
                if let Ok(value) = secs.to_string().parse() {
                    resp.headers_mut().insert(header::RETRY_AFTER, value);
                }
                resp
            }
            SearchError::InvalidImage(_) => {
                error_body(StatusCode::BAD_REQUEST, "invalid_image", &message).into_response()
            }
            SearchError::NoFace => {
                error_body(StatusCode::UNPROCESSABLE_ENTITY, "no_face", &message).into_response()
            }
            SearchError::Extraction { .. } => {
                tracing::error!(error = %message, "search extraction failed");
                error_body(StatusCode::BAD_GATEWAY, "extraction", &message).into_response()
            }
            SearchError::Index { .. } => {
                tracing::error!(error = %message, "search index query failed");
                error_body(StatusCode::BAD_GATEWAY, "index", &message).into_response()
            }
            SearchError::Internal(_) => {
                tracing::error!(error = %message, "search task failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal", &message).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        let busy = SearchError::Busy {
            retry_after: Duration::from_secs(5),
        }
        .into_response();
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(busy.headers()[header::RETRY_AFTER], "5");

        assert_eq!(SearchError::NoFace.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            SearchError::Internal("join".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let invalid = SearchError::InvalidImage(oceano_core::FrameError::Empty).into_response();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_sub_second_busy_rounds_up() {
        let busy = SearchError::Busy {
            retry_after: Duration::from_millis(200),
        }
        .into_response();
        assert_eq!(busy.headers()[header::RETRY_AFTER], "1");
    }
}
