//! HTTP endpoints of the relay.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/internal/cdc` | Resolve `{records}` to `{users}` |
//! | `POST` | `/webhooks/cdc` | Ingest emitter batches and deliver them |
//! | `POST` | `/internal/lifecycle` | Apply a subscription lifecycle event |
//! | `GET` | `/health` | Liveness and open session count |

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::cdcrelay::handler::EventHandler;
use crate::cdcrelay::hub::StreamHub;
use crate::cdcrelay::lifecycle::{spawn_lifecycle, LifecycleEvent};
use crate::cdcrelay::record::{RouteRequest, RouteResponse};

/// Retries for lifecycle events applied in the background
const BACKGROUND_RETRIES: u32 = 2;
const BACKGROUND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// State shared by all handlers
#[derive(Clone)]
pub struct HttpState {
    pub handler: Arc<EventHandler>,
    pub hub: Arc<StreamHub>,
    pub webhook_secret: Option<String>,
}

pub fn http_router(state: HttpState) -> Router {
    Router::new()
        .route("/internal/cdc", post(route_cdc))
        .route("/webhooks/cdc", post(ingest_webhook))
        .route("/internal/lifecycle", post(apply_lifecycle))
        .route("/health", get(health))
        .with_state(state)
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    let label = if status == StatusCode::UNAUTHORIZED { "unauthorized" } else { "error" };
    (status, Json(ErrorResponse { status: label, error: msg.into() })).into_response()
}

/// `POST /internal/cdc`: resolve a batch to its recipients.
pub async fn route_cdc(State(state): State<HttpState>, body: Bytes) -> Response {
    let request: RouteRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting route request: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    let mut users: Vec<_> = state.handler.route_values(request.records).into_iter().collect();
    users.sort();
    Json(RouteResponse { users }).into_response()
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    processed: usize,
    delivered: usize,
    dropped: usize,
}

/// `POST /webhooks/cdc`: ingest emitter output and push it to streams.
pub async fn ingest_webhook(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = state.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        let expected = format!("Bearer {}", secret);
        let presented = headers.get(header::AUTHORIZATION).map(|v| v.as_bytes()).unwrap_or_default();
        if !secrets_match(presented, expected.as_bytes()) {
            return error_response(StatusCode::UNAUTHORIZED, "Invalid webhook secret");
        }
    }

    let report = match state.handler.ingest_body(&body) {
        Ok(report) => report,
        Err(e) => {
            warn!("Failed to parse CDC records: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "Invalid CDC payload");
        }
    };

    Json(IngestResponse {
        status: "ok",
        processed: report.processed,
        delivered: report.delivered,
        dropped: report.dropped_records,
    })
    .into_response()
}

/// Compare without exiting on the first differing byte
fn secrets_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug, Default, Deserialize)]
pub struct LifecycleQuery {
    #[serde(default)]
    background: bool,
}

/// `POST /internal/lifecycle`: apply a subscribe/unsubscribe/config/reconcile event.
///
/// With `?background=true` the event runs as a retried background task and
/// the call returns `202` straight away.
pub async fn apply_lifecycle(
    State(state): State<HttpState>,
    Query(query): Query<LifecycleQuery>,
    body: Bytes,
) -> Response {
    let event: LifecycleEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejecting lifecycle event: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    if query.background {
        let user = event.user().to_string();
        let task = spawn_lifecycle(
            state.handler.lifecycle.clone(),
            event,
            BACKGROUND_RETRIES,
            BACKGROUND_RETRY_DELAY,
        );
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!("Background lifecycle task for {} failed: {}", user, e);
            }
        });
        return (StatusCode::ACCEPTED, Json(serde_json::json!({ "accepted": true }))).into_response();
    }

    Json(state.handler.handle_lifecycle(&event)).into_response()
}

/// `GET /health`: liveness check.
pub async fn health(State(state): State<HttpState>) -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "sessions": state.hub.session_count(),
    }))
    .into_response()
}
