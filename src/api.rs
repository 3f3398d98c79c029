//! HTTP API handlers for SafeLink.
//!
//! Thin axum handlers over [`MeshNode`]. Every handler returns
//! `Result<Json<T>, StatusCode>`; errors map as follows:
//!
//! | Error                  | Status |
//! |------------------------|--------|
//! | `MeshError::Validation` | 422   |
//! | `MeshError::NotFound`   | 404   |
//! | `MeshError::Creation`   | 500   |
//! | `MeshError::Storage`    | 500   |
//!
//! Message content is never logged; handlers record ids and counts only.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::alerts::ReliefOutcome;
use crate::error::MeshError;
use crate::mesh::MeshNode;
use crate::model::{
    AlertRecord, AutoModeUpdate, BroadcastRequest, CreateReliefRequest, DeliverySummary,
    HealthSnapshot, ManualAlertRequest, MessageEnvelope, Peer, QueueSummary, RecentAlertsQuery,
    ReliefRequest, ReliefStatusUpdate, RetrySweep, SendDirectRequest,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<MeshNode>,
}

/// Response body for POST /alerts/auto.
#[derive(Debug, Serialize)]
pub struct AutoModeResponse {
    pub enabled: bool,
}

/// Build the full HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/network", get(get_network_health))
        .route("/peers", get(list_peers).post(upsert_peer))
        .route("/broadcast", post(post_broadcast))
        .route("/messages", post(post_message))
        .route("/messages/summary", get(get_queue_summary))
        .route("/messages/retry", post(retry_failed))
        .route("/alerts", post(post_alert))
        .route("/alerts/recent", get(get_recent_alerts))
        .route("/alerts/auto", post(set_auto_mode))
        .route("/relief", post(post_relief))
        .route("/relief/open", get(get_open_relief))
        .route("/relief/:id/status", post(post_relief_status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn status_for(error: &MeshError) -> StatusCode {
    match error {
        MeshError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        MeshError::NotFound { .. } => StatusCode::NOT_FOUND,
        MeshError::Creation(_) | MeshError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(operation: &'static str, error: MeshError) -> StatusCode {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(operation, error = %error, "Request failed");
    } else {
        info!(operation, error = %error, "Request rejected");
    }
    status
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /health/network - Current delivery health snapshot.
#[instrument(skip(state))]
pub async fn get_network_health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    let snapshot = state.node.get_health_snapshot();
    info!(
        success_rate = snapshot.success_rate,
        reliability = ?snapshot.reliability_score,
        sync_lag = snapshot.sync_lag,
        "Health queried"
    );
    Json(snapshot)
}

/// GET /peers - Every known peer, stale ones included.
#[instrument(skip(state))]
pub async fn list_peers(State(state): State<AppState>) -> Json<Vec<Peer>> {
    Json(state.node.peers().all().await)
}

/// POST /peers - Record a discovery event.
///
/// # Request Body
///
/// ```json
/// {
///     "id": "peer-7",
///     "name": "Relief truck 7",
///     "signal_strength": -62,
///     "coordinates": { "lat": 27.71, "lon": 85.32 }
/// }
/// ```
///
/// Returns `202 Accepted`.
#[instrument(skip(state, peer), fields(peer_id = %peer.id))]
pub async fn upsert_peer(
    State(state): State<AppState>,
    Json(peer): Json<Peer>,
) -> Result<StatusCode, StatusCode> {
    state
        .node
        .upsert_peer(peer)
        .await
        .map_err(|e| reject("upsert_peer", e))?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /broadcast - Fan a message out to nearby peers.
///
/// # Request Body
///
/// ```json
/// {
///     "sender_id": "node-1",
///     "content": "Flood warning",
///     "center": { "lat": 27.7172, "lon": 85.324 },
///     "radius_km": 10,
///     "priority": "high",
///     "hops_left": 2
/// }
/// ```
///
/// Without `priority` the tier is classified from `content`. `extra_meta`
/// may not set `priority` or `hops_left` (422).
///
/// Responds with the delivery summary once every delivery has finished.
#[instrument(skip(state, request), fields(sender_id = %request.sender_id, priority = ?request.priority))]
pub async fn post_broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<DeliverySummary>, StatusCode> {
    let summary = state
        .node
        .broadcast(request)
        .await
        .map_err(|e| reject("broadcast", e))?;
    Ok(Json(summary))
}

/// POST /messages - Send a direct message with a single delivery attempt.
///
/// Omit `receiver_id` to let the router choose the best peer, and `priority`
/// to classify it from `content`.
#[instrument(skip(state, request), fields(sender_id = %request.sender_id))]
pub async fn post_message(
    State(state): State<AppState>,
    Json(request): Json<SendDirectRequest>,
) -> Result<Json<MessageEnvelope>, StatusCode> {
    let envelope = state
        .node
        .send_direct(request)
        .await
        .map_err(|e| reject("send_direct", e))?;
    info!(
        message_id = %envelope.id,
        status = envelope.status.as_str(),
        "Direct message processed"
    );
    Ok(Json(envelope))
}

/// GET /messages/summary - Queue counts by status.
pub async fn get_queue_summary(State(state): State<AppState>) -> Json<QueueSummary> {
    Json(state.node.relay().queue_summary().await)
}

/// POST /messages/retry - Resubmit every failed message.
#[instrument(skip(state))]
pub async fn retry_failed(State(state): State<AppState>) -> Json<RetrySweep> {
    Json(state.node.relay().retry_failed_messages().await)
}

/// POST /alerts - Raise a manual alert.
///
/// # Request Body
///
/// ```json
/// {
///     "sender_id": "ops",
///     "message": "Shelter open at the school",
///     "category": "shelter",
///     "priority": "normal",
///     "center": { "lat": 27.7172, "lon": 85.324 },
///     "radius_km": 30
/// }
/// ```
///
/// `category` and `radius_km` default to `general` and 30. Without
/// `priority` the tier is classified from `message`.
#[instrument(skip(state, request), fields(sender_id = %request.sender_id))]
pub async fn post_alert(
    State(state): State<AppState>,
    Json(request): Json<ManualAlertRequest>,
) -> Result<Json<AlertRecord>, StatusCode> {
    if request.message.trim().is_empty() {
        return Err(reject(
            "send_manual_alert",
            MeshError::Validation("alert message must not be empty".to_string()),
        ));
    }
    Ok(Json(state.node.alerts().send_manual_alert(request).await))
}

/// GET /alerts/recent - The most recent alerts, oldest first.
///
/// # Query Parameters
///
/// - `limit` (optional): How many alerts to return (default: 5)
#[instrument(skip(state))]
pub async fn get_recent_alerts(
    State(state): State<AppState>,
    Query(query): Query<RecentAlertsQuery>,
) -> Json<Vec<AlertRecord>> {
    Json(state.node.alerts().recent_alerts(query.limit).await)
}

/// POST /alerts/auto - Turn automatic health alerts on or off.
#[instrument(skip(state))]
pub async fn set_auto_mode(
    State(state): State<AppState>,
    Json(update): Json<AutoModeUpdate>,
) -> Json<AutoModeResponse> {
    let alerts = state.node.alerts();
    if update.enabled {
        alerts.enable_auto();
    } else {
        alerts.disable_auto();
    }
    Json(AutoModeResponse {
        enabled: alerts.is_auto_enabled(),
    })
}

/// POST /relief - Create a relief request and broadcast it.
///
/// # Request Body
///
/// ```json
/// {
///     "sender_id": "ngo-1",
///     "type": "medical",
///     "title": "Insulin needed",
///     "items": [{ "name": "insulin", "qty": 20, "unit": "vials" }],
///     "location": { "lat": 27.7172, "lon": 85.324 },
///     "radius_km": 15
/// }
/// ```
///
/// Every field other than `sender_id` is optional.
#[instrument(skip(state, request), fields(sender_id = %request.sender_id))]
pub async fn post_relief(
    State(state): State<AppState>,
    Json(request): Json<CreateReliefRequest>,
) -> Result<Json<ReliefOutcome>, StatusCode> {
    let outcome = state
        .node
        .create_relief_request(&request.sender_id, request.payload)
        .await
        .map_err(|e| reject("create_relief_request", e))?;
    Ok(Json(outcome))
}

/// GET /relief/open - Relief requests still open or partially fulfilled.
#[instrument(skip(state))]
pub async fn get_open_relief(
    State(state): State<AppState>,
) -> Result<Json<Vec<ReliefRequest>>, StatusCode> {
    let open = state
        .node
        .get_open_relief_requests()
        .await
        .map_err(|e| reject("get_open_relief_requests", e))?;
    Ok(Json(open))
}

/// POST /relief/:id/status - Overwrite a relief request's status.
#[instrument(skip(state, update))]
pub async fn post_relief_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ReliefStatusUpdate>,
) -> Result<Json<ReliefRequest>, StatusCode> {
    let request = state
        .node
        .mark_relief_status(&id, update.status)
        .await
        .map_err(|e| reject("mark_relief_status", e))?;
    Ok(Json(request))
}
