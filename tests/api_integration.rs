//! Integration tests for Lifeline API endpoints.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::TestServer;
use serde_json::{Value, json};
use tower::ServiceExt;

use lifeline::api::{AppState, router};
use lifeline::config::DispatchConfig;
use lifeline::dispatch::DispatchCoordinator;
use lifeline::storage::Storage;

async fn create_state() -> AppState {
    let storage = Storage::new("sqlite::memory:").await.unwrap();
    let coordinator = DispatchCoordinator::start(storage, &DispatchConfig::default())
        .await
        .unwrap();
    AppState { coordinator }
}

async fn create_test_server() -> TestServer {
    TestServer::new(router(create_state().await)).unwrap()
}

/// Latitude offset, in degrees, for `meters` due north.
fn north(meters: f64) -> f64 {
    40.7128 + (meters / 6_371_000.0_f64).to_degrees()
}

async fn put_responder(server: &TestServer, id: &str, meters: f64) {
    server
        .put(&format!("/responders/{id}/availability"))
        .json(&json!({
            "is_available": true,
            "latitude": north(meters),
            "longitude": -74.0060,
            "capabilities": ["medical"],
            "notification_radius_m": 5000.0
        }))
        .await
        .assert_status_ok();
}

async fn raise_alert(server: &TestServer, requester: &str) -> Value {
    let response = server
        .post("/alerts")
        .json(&json!({
            "requester_id": requester,
            "emergency_type": "medical",
            "urgency": "critical",
            "title": "Collapsed on the platform",
            "location": { "latitude": 40.7128, "longitude": -74.0060 }
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}

async fn accept(server: &TestServer, alert_id: &str, responder: &str) -> Value {
    let response = server
        .post(&format!("/alerts/{alert_id}/responses"))
        .json(&json!({
            "responder_id": responder,
            "decision": "accepted",
            "estimated_arrival_minutes": 5
        }))
        .await;
    response.assert_status_ok();
    response.json()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_health_endpoint_without_server() {
    let app = router(create_state().await);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_alert_notifies_in_distance_order() {
    let server = create_test_server().await;
    for (id, meters) in [("r-920", 920.0), ("r-450", 450.0), ("r-680", 680.0)] {
        put_responder(&server, id, meters).await;
    }

    let body = raise_alert(&server, "victim-1").await;

    assert_eq!(body["alert"]["status"], "pending");
    assert_eq!(body["alert"]["urgency"], "critical");
    assert_eq!(body["notified_count"], 3);
    assert_eq!(body["matching"], "completed");
    let ids: Vec<_> = body["candidates"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["responder_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["r-450", "r-680", "r-920"]);
}

#[tokio::test]
async fn test_create_alert_validation() {
    let server = create_test_server().await;

    let missing_location = server
        .post("/alerts")
        .json(&json!({
            "requester_id": "victim-1",
            "emergency_type": "medical"
        }))
        .await;
    missing_location.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = missing_location.json();
    assert_eq!(body["error"], "validation_error");

    let bad_latitude = server
        .post("/alerts")
        .json(&json!({
            "requester_id": "victim-1",
            "emergency_type": "medical",
            "location": { "latitude": 123.0, "longitude": 0.0 }
        }))
        .await;
    bad_latitude.assert_status(StatusCode::BAD_REQUEST);

    let unknown_type = server
        .post("/alerts")
        .json(&json!({
            "requester_id": "victim-1",
            "emergency_type": "alien-invasion",
            "location": { "latitude": 1.0, "longitude": 1.0 }
        }))
        .await;
    unknown_type.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_bodies_are_validation_errors() {
    let server = create_test_server().await;

    let wrong_type = server
        .post("/alerts")
        .json(&json!({
            "requester_id": "victim-1",
            "emergency_type": "medical",
            "location": { "latitude": "forty", "longitude": -74.0060 }
        }))
        .await;
    wrong_type.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = wrong_type.json();
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("latitude"));

    let unknown_decision = server
        .post("/alerts/7f1b8a3e-9a43-4c1e-8f5e-3b1c2a9d0e11/responses")
        .json(&json!({ "responder_id": "r-1", "decision": "maybe" }))
        .await;
    unknown_decision.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = unknown_decision.json();
    assert_eq!(body["error"], "validation_error");

    let not_json = server
        .put("/responders/r-1/availability")
        .text("is_available=true")
        .await;
    not_json.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = not_json.json();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_second_active_alert_is_rejected() {
    let server = create_test_server().await;
    raise_alert(&server, "victim-1").await;

    let response = server
        .post("/alerts")
        .json(&json!({
            "requester_id": "victim-1",
            "emergency_type": "fire",
            "location": { "latitude": 40.7128, "longitude": -74.0060 }
        }))
        .await;

    response.assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_get_unknown_alert() {
    let server = create_test_server().await;

    let response = server
        .get("/alerts/7f1b8a3e-9a43-4c1e-8f5e-3b1c2a9d0e11")
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_first_acceptance_wins_and_later_ones_are_thanked() {
    let server = create_test_server().await;
    put_responder(&server, "r-450", 450.0).await;
    put_responder(&server, "r-680", 680.0).await;
    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();

    let first = accept(&server, id, "r-450").await;
    let second = accept(&server, id, "r-680").await;

    assert_eq!(first["outcome"], "acknowledged");
    assert_eq!(first["alert"]["status"], "acknowledged");
    assert_eq!(second["outcome"], "already_acknowledged");
    assert_eq!(second["message"], "alert already being handled, thank you");

    let responses: Value = server
        .get(&format!("/alerts/{id}/responses"))
        .await
        .json();
    assert_eq!(responses.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancel_flow() {
    let server = create_test_server().await;
    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();

    let forbidden = server
        .post(&format!("/alerts/{id}/cancel"))
        .json(&json!({ "actor_id": "someone-else" }))
        .await;
    forbidden.assert_status(StatusCode::FORBIDDEN);

    let cancelled = server
        .post(&format!("/alerts/{id}/cancel"))
        .json(&json!({ "actor_id": "victim-1" }))
        .await;
    cancelled.assert_status_ok();
    let body: Value = cancelled.json();
    assert_eq!(body["alert"]["status"], "cancelled");
    assert_eq!(body["alert"]["cancelled_by"], "victim-1");
    assert!(body["alert"]["resolved_at"].is_string());

    let again = server
        .post(&format!("/alerts/{id}/cancel"))
        .json(&json!({ "actor_id": "victim-1" }))
        .await;
    again.assert_status(StatusCode::CONFLICT);
    let body: Value = again.json();
    assert_eq!(body["message"], "already cancelled");

    let again_by_status = server
        .post(&format!("/alerts/{id}/status"))
        .json(&json!({ "actor_id": "victim-1", "status": "cancelled" }))
        .await;
    again_by_status.assert_status(StatusCode::CONFLICT);
    let body: Value = again_by_status.json();
    assert_eq!(body["message"], "already cancelled");
}

#[tokio::test]
async fn test_cancel_by_status_update() {
    let server = create_test_server().await;
    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();

    let cancelled = server
        .post(&format!("/alerts/{id}/status"))
        .json(&json!({ "actor_id": "victim-1", "status": "cancelled" }))
        .await;
    cancelled.assert_status_ok();
    let body: Value = cancelled.json();
    assert_eq!(body["outcome"], "transitioned");
    assert_eq!(body["alert"]["cancelled_by"], "victim-1");

    let again = server
        .post(&format!("/alerts/{id}/cancel"))
        .json(&json!({ "actor_id": "victim-1" }))
        .await;
    again.assert_status(StatusCode::CONFLICT);
    let body: Value = again.json();
    assert_eq!(body["message"], "already cancelled");
}

#[tokio::test]
async fn test_status_transitions() {
    let server = create_test_server().await;
    put_responder(&server, "r-450", 450.0).await;
    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();

    let skip = server
        .post(&format!("/alerts/{id}/status"))
        .json(&json!({ "actor_id": "victim-1", "status": "resolved" }))
        .await;
    skip.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    accept(&server, id, "r-450").await;

    let started = server
        .post(&format!("/alerts/{id}/status"))
        .json(&json!({ "actor_id": "r-450", "status": "in_progress" }))
        .await;
    started.assert_status_ok();
    let body: Value = started.json();
    assert_eq!(body["outcome"], "transitioned");
    assert_eq!(body["from"], "acknowledged");

    let repeat = server
        .post(&format!("/alerts/{id}/status"))
        .json(&json!({ "actor_id": "r-450", "status": "in_progress" }))
        .await;
    repeat.assert_status_ok();
    let body: Value = repeat.json();
    assert_eq!(body["outcome"], "already_in_state");

    let resolved = server
        .post(&format!("/alerts/{id}/status"))
        .json(&json!({ "actor_id": "victim-1", "status": "resolved" }))
        .await;
    resolved.assert_status_ok();
    let body: Value = resolved.json();
    assert_eq!(body["alert"]["status"], "resolved");

    let late = server
        .post(&format!("/alerts/{id}/responses"))
        .json(&json!({ "responder_id": "r-999", "decision": "accepted" }))
        .await;
    late.assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_progress_and_rating() {
    let server = create_test_server().await;
    put_responder(&server, "r-450", 450.0).await;
    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();
    accept(&server, id, "r-450").await;

    server
        .post(&format!("/alerts/{id}/responses/r-450/progress"))
        .json(&json!({ "step": "arrived" }))
        .await
        .assert_status_ok();
    let current: Value = server.get(&format!("/alerts/{id}")).await.json();
    assert_eq!(current["status"], "in_progress");

    let early_rating = server
        .post(&format!("/alerts/{id}/responses/r-450/rating"))
        .json(&json!({ "actor_id": "victim-1", "rating": 5 }))
        .await;
    early_rating.assert_status(StatusCode::CONFLICT);

    server
        .post(&format!("/alerts/{id}/responses/r-450/progress"))
        .json(&json!({ "step": "completed" }))
        .await
        .assert_status_ok();

    let rated = server
        .post(&format!("/alerts/{id}/responses/r-450/rating"))
        .json(&json!({ "actor_id": "victim-1", "rating": 4, "feedback": "Calm and fast" }))
        .await;
    rated.assert_status_ok();
    let body: Value = rated.json();
    assert_eq!(body["rating"], 4);
    assert_eq!(body["feedback"], "Calm and fast");

    let stats: Value = server.get("/responders/r-450/stats").await.json();
    assert_eq!(stats["total_responses"], 1);
    assert_eq!(stats["accepted_responses"], 1);
    assert_eq!(stats["completed_responses"], 1);
    assert_eq!(stats["average_rating"], 4.0);
}

#[tokio::test]
async fn test_availability_and_eligibility() {
    let server = create_test_server().await;

    let too_wide = server
        .put("/responders/r-1/availability")
        .json(&json!({
            "is_available": true,
            "latitude": 40.7128,
            "longitude": -74.0060,
            "capabilities": ["medical"],
            "notification_radius_m": 99_000.0
        }))
        .await;
    too_wide.assert_status(StatusCode::BAD_REQUEST);

    put_responder(&server, "r-1", 300.0).await;
    let stored: Value = server.get("/responders/r-1/availability").await.json();
    assert_eq!(stored["notification_radius_m"], 5000.0);

    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();

    // Going off duty removes the responder from future matches.
    server
        .put("/responders/r-1/availability")
        .json(&json!({
            "is_available": false,
            "latitude": north(300.0),
            "longitude": -74.0060,
            "capabilities": ["medical"]
        }))
        .await
        .assert_status_ok();

    let eligible: Value = server.get(&format!("/alerts/{id}/eligible")).await.json();
    assert!(eligible.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_histories() {
    let server = create_test_server().await;
    put_responder(&server, "r-450", 450.0).await;
    let alert = raise_alert(&server, "victim-1").await;
    let id = alert["alert"]["id"].as_str().unwrap();
    accept(&server, id, "r-450").await;

    let active: Value = server.get("/alerts/active").await.json();
    assert_eq!(active.as_array().unwrap().len(), 1);

    let history: Value = server
        .get("/requesters/victim-1/alerts?status=acknowledged")
        .await
        .json();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["id"], id);

    let none: Value = server
        .get("/requesters/victim-1/alerts?status=resolved")
        .await
        .json();
    assert!(none.as_array().unwrap().is_empty());

    let responses: Value = server.get("/responders/r-450/responses").await.json();
    assert_eq!(responses.as_array().unwrap().len(), 1);
    assert_eq!(responses[0]["decision"], "accepted");
}
