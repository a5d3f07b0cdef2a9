//! API integration tests for tidal-central.
//!
//! These exercise the REST surface through axum's tower service
//! interface (no TCP). The path loop is stood in for by a small task
//! answering force-sync requests over the same channel the real loop
//! uses.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tower::ServiceExt;

use tidal_common::alerts::AlertJournal;
use tidal_common::models::{
    BandwidthCost, CostSource, DocumentMetadata, LoadBalancingMode, PathDetail,
    PathSelectionDocument, RouteEntry,
};

use tidal_central::state::AppState;

/// Build a test app. The force-sync responder answers `ok` times with
/// success, then drops the channel.
fn test_app(sync_responses: usize) -> (Router, AppState) {
    let journal = Arc::new(AlertJournal::in_memory(64));
    let (tx, mut rx) = mpsc::channel(8);
    let state = AppState::new(journal, tx);

    tokio::spawn(async move {
        for _ in 0..sync_responses {
            let Some(reply) = rx.recv().await else {
                return;
            };
            let _: Result<_, _> = reply.send(Ok(()));
        }
    });

    let app = Router::new()
        .merge(tidal_central::api::router())
        .with_state(state.clone());
    (app, state)
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(&bytes);
        panic!("not valid JSON: {text}");
    })
}

fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("POST")
        .body(Body::empty())
        .unwrap()
}

fn sample_document() -> PathSelectionDocument {
    let mut details = BTreeMap::new();
    details.insert(
        "path_0".to_string(),
        PathDetail {
            via_spine: "spine0".to_string(),
            selection_ratio: 0.2,
            bandwidth_cost: BandwidthCost::new(4e6, CostSource::Predicted),
        },
    );
    details.insert(
        "path_1".to_string(),
        PathDetail {
            via_spine: "spine1".to_string(),
            selection_ratio: 0.8,
            bandwidth_cost: BandwidthCost::new(1e6, CostSource::Predicted),
        },
    );
    let mut weights = BTreeMap::new();
    weights.insert("leaf1->leaf6".to_string(), RouteEntry { path_details: details });
    PathSelectionDocument {
        metadata: DocumentMetadata {
            timestamp_utc8: "2026-08-01 17:00:00".to_string(),
            iteration: 1,
            load_balancing_mode: LoadBalancingMode::Prediction,
            using_predictions: true,
            description: "test".to_string(),
        },
        path_selection_weights: weights,
    }
}

#[tokio::test]
async fn health_reports_healthy() {
    let (app, _state) = test_app(0);
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(json_body(resp).await["status"], "healthy");
}

#[tokio::test]
async fn current_weights_is_404_until_first_publication() {
    let (app, state) = test_app(0);
    let resp = app.clone().oneshot(get("/current_weights")).await.unwrap();
    assert_eq!(resp.status(), 404);

    state.store_weights(sample_document());
    let resp = app.oneshot(get("/current_weights")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["metadata"]["iteration"], 1);
    assert_eq!(
        body["path_selection_weights"]["leaf1->leaf6"]["path_details"]["path_1"]
            ["selection_ratio"],
        0.8
    );
}

#[tokio::test]
async fn stats_reflect_push_and_collection_counters() {
    let (app, state) = test_app(0);

    let resp = app.clone().oneshot(get("/stats")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["total_pushes"], 0);
    assert_eq!(body["successful_pushes"], 0);
    assert!(body["last_push_time"].is_null());

    let now = chrono::Utc::now();
    state.record_collection(now);
    state.record_push(now, true);
    state.record_push(now, false);
    state.set_accuracies([("leaf1-spine0-leaf6".to_string(), 0.07)].into_iter().collect());

    let resp = app.oneshot(get("/stats")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["total_pushes"], 2);
    assert_eq!(body["successful_pushes"], 1);
    assert!(!body["last_push_time"].is_null());
    assert!(!body["last_collection"].is_null());
    assert_eq!(body["model_accuracy"]["leaf1-spine0-leaf6"], 0.07);
}

#[tokio::test]
async fn force_sync_round_trips_through_the_path_loop() {
    let (app, _state) = test_app(1);
    let resp = app.oneshot(post("/force_sync")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn force_sync_reports_failure_when_the_loop_is_gone() {
    let (app, _state) = test_app(0);
    // Give the responder task a moment to exit and drop the channel.
    tokio::task::yield_now().await;
    let resp = app.oneshot(post("/force_sync")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["success"], false);
}
