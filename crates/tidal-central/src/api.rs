//! Operator HTTP API.
//!
//! `GET /health` — liveness
//! `GET /current_weights` — latest path-selection document
//! `GET /stats` — push/collection counters and model accuracy
//! `POST /force_sync` — immediate re-ship to the SDN host

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/current_weights", get(current_weights))
        .route("/stats", get(stats))
        .route("/force_sync", post(force_sync))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn current_weights(State(state): State<AppState>) -> impl IntoResponse {
    match state.weights() {
        Some(doc) => Json(serde_json::to_value(&*doc).unwrap_or_default()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no weight document published yet"})),
        )
            .into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats())
}

async fn force_sync(State(state): State<AppState>) -> impl IntoResponse {
    match state.request_force_sync().await {
        Ok(()) => Json(json!({"success": true, "message": "weights re-shipped"})),
        Err(e) => Json(json!({"success": false, "message": e.to_string()})),
    }
}
