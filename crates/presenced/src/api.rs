//! HTTP surface of the daemon.

use crate::auth::{Authenticated, JwtVerifier};
use crate::error::ApiError;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use presence_core::{
    AttendanceClaim, AttendanceStore as _, CancelOutcome, CheckType, Orchestrator, SessionType,
    ZoneId,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub jwt: JwtVerifier,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/attendance", post(submit_attendance))
        .route("/api/attendance/history", get(history))
        .route("/api/attendance/cancel", post(cancel))
        .route("/api/locations", get(locations))
        .route("/api/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    check_type: CheckType,
    session_type: SessionType,
    #[serde(default)]
    latitude: Value,
    #[serde(default)]
    longitude: Value,
    location_id: ZoneId,
}

/// Numbers and numeric strings are accepted; anything else becomes NaN and
/// is rejected by coordinate validation.
fn coordinate(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

async fn root() -> &'static str {
    "Attendance API is running"
}

async fn submit_attendance(
    State(state): State<Arc<AppState>>,
    Authenticated(session): Authenticated,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let claim = AttendanceClaim {
        zone_id: request.location_id,
        check_type: request.check_type,
        session_type: request.session_type,
        claimed_latitude: coordinate(&request.latitude),
        claimed_longitude: coordinate(&request.longitude),
    };

    let record = state
        .orchestrator
        .submit_attendance(&session, claim)
        .await?;

    Ok(Json(json!({ "message": "Attendance recorded", "record": record })))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Authenticated(session): Authenticated,
) -> Result<Json<Value>, ApiError> {
    let entries = state
        .orchestrator
        .store()
        .history(session.person_id)
        .await?;
    Ok(Json(json!(entries)))
}

async fn locations(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let zones = state.orchestrator.store().list_zones().await?;
    Ok(Json(json!(zones)))
}

/// Stop the in-flight verification. Callers may only cancel their own
/// attempt; administrators may cancel any.
async fn cancel(
    State(state): State<Arc<AppState>>,
    Authenticated(session): Authenticated,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .orchestrator
        .matcher()
        .cancel_attempt(session.person_id, session.is_admin());
    tracing::info!(person_id = session.person_id, ?outcome, "verification cancel requested");

    match outcome {
        CancelOutcome::NotOwner => Err(ApiError::Forbidden(
            "Verification in progress belongs to another user".into(),
        )),
        CancelOutcome::Cancelled | CancelOutcome::Idle => Ok(Json(json!({
            "message": "Verification stopped",
            "cancelled": outcome == CancelOutcome::Cancelled,
        }))),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let matcher = state.orchestrator.matcher();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "state": matcher.state().name(),
        "busy": matcher.is_busy(),
        "modelsLoaded": matcher.models_loaded(),
        "camera": matcher.camera_description(),
        "threshold": matcher.config().threshold,
    }))
}
