//! Charging REST API
//!
//! The engine RPC surface: dry rating, debits, refunds and session limits.
//! Credit shortfalls answer with an empty call cost and an error code
//! instead of a transport failure.

use axum::http::StatusCode;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use ocs_core::OcsError;

use crate::account::AccountEngine;
use crate::types::{CallCost, CallDescriptor};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AccountEngine>,
}

pub fn create_router(engine: Arc<AccountEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        // Health
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Charging
        .route("/v1/cost", post(get_cost))
        .route("/v1/debit", post(debit))
        .route("/v1/max-debit", post(max_debit))
        .route("/v1/refund-increments", post(refund_increments))
        .route("/v1/max-session-time", post(max_session_time))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn ready() -> &'static str {
    "OK"
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn to_api_error(e: &OcsError) -> ApiError {
    (
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({ "error": e.error_code(), "message": e.to_string() })),
    )
}

/// Credit errors return an empty-timespan call cost with the error code
/// attached; everything else maps to a status.
fn charge_reply(
    cd: &CallDescriptor,
    result: Result<CallCost, OcsError>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match result {
        Ok(cc) => Ok(Json(json!({ "call_cost": cc }))),
        Err(e) if e.is_credit_error() => Ok(Json(json!({
            "call_cost": cd.create_call_cost(),
            "error": e.error_code(),
        }))),
        Err(e) => Err(to_api_error(&e)),
    }
}

async fn get_cost(
    State(state): State<AppState>,
    Json(cd): Json<CallDescriptor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cc = state.engine.get_cost(&cd).await.map_err(|e| to_api_error(&e))?;
    Ok(Json(json!({ "call_cost": cc })))
}

async fn debit(
    State(state): State<AppState>,
    Json(cd): Json<CallDescriptor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    charge_reply(&cd, state.engine.debit(&cd).await)
}

async fn max_debit(
    State(state): State<AppState>,
    Json(cd): Json<CallDescriptor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    charge_reply(&cd, state.engine.max_debit(&cd).await)
}

async fn refund_increments(
    State(state): State<AppState>,
    Json(cc): Json<CallCost>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let balance = state
        .engine
        .refund_increments(&cc)
        .await
        .map_err(|e| to_api_error(&e))?;
    Ok(Json(json!({ "balance": balance })))
}

/// Seconds the session may last; -1 means unlimited.
async fn max_session_time(
    State(state): State<AppState>,
    Json(cd): Json<CallDescriptor>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reply = state
        .engine
        .get_max_session_duration(&cd)
        .await
        .map_err(|e| to_api_error(&e))?;
    let seconds = match reply {
        Some(duration) => duration.as_secs_f64(),
        None => -1.0,
    };
    Ok(Json(json!({ "max_session_seconds": seconds })))
}
