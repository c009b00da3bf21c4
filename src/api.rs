//! HTTP API handlers for Lifeline.
//!
//! Handlers are thin: they extract the request, call the coordinator and map
//! the outcome. Failures come back as [`DispatchError`], which renders itself
//! as a JSON body with a matching status code.
//!
//! Responder and requester identities arrive in paths and bodies as opaque
//! strings; authenticating them is the job of whatever sits in front of this
//! service.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequest, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchCoordinator, DispatchReport, Subscription};
use crate::error::DispatchError;
use crate::model::{
    Alert, AlertSpec, AvailabilityUpdate, CancelRequest, Candidate, HistoryQuery, LimitQuery,
    ProgressRequest, RatingRequest, ResponderAvailability, ResponderStats, Response,
    ResponseReceipt, ResponseSubmission, StatusRequest, Transition,
};
use crate::notify::Topic;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DispatchCoordinator>,
}

/// JSON body extractor whose rejections render as [`DispatchError`].
#[derive(FromRequest)]
#[from_request(via(Json), rejection(DispatchError))]
pub struct AppJson<T>(pub T);

/// Every route served by Lifeline.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alerts", post(create_alert))
        .route("/alerts/active", get(list_active_alerts))
        .route("/alerts/:id", get(get_alert))
        .route(
            "/alerts/:id/responses",
            post(submit_response).get(list_responses),
        )
        .route(
            "/alerts/:id/responses/:responder_id/progress",
            post(update_progress),
        )
        .route(
            "/alerts/:id/responses/:responder_id/rating",
            post(rate_response),
        )
        .route("/alerts/:id/cancel", post(cancel_alert))
        .route("/alerts/:id/status", post(update_alert_status))
        .route("/alerts/:id/eligible", get(list_eligible_responders))
        .route("/requesters/:id/alerts", get(requester_history))
        .route("/responders/:id/responses", get(responder_responses))
        .route("/responders/:id/stats", get(responder_stats))
        .route(
            "/responders/:id/availability",
            get(get_availability).put(put_availability),
        )
        .route("/subscribe/:topic", get(subscribe))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /alerts - Raise an alert and fan it out.
///
/// # Request Body
///
/// ```json
/// {
///     "requester_id": "user-17",
///     "emergency_type": "medical",
///     "urgency": "critical",
///     "title": "Collapsed on the platform",
///     "location": { "latitude": 40.7128, "longitude": -74.006 }
/// }
/// ```
///
/// # Response
///
/// `201 Created` with the stored alert, the ordered candidates and how many
/// of them were notified.
#[instrument(skip(state, spec))]
pub async fn create_alert(
    State(state): State<AppState>,
    AppJson(spec): AppJson<AlertSpec>,
) -> Result<(StatusCode, Json<DispatchReport>), DispatchError> {
    let report = state.coordinator.create_and_dispatch(spec).await?;
    info!(
        alert_id = %report.alert.id,
        notified = report.notified_count,
        matching = ?report.matching,
        "Alert raised"
    );
    Ok((StatusCode::CREATED, Json(report)))
}

/// GET /alerts/active - Alerts that have not reached a terminal status.
#[instrument(skip(state))]
pub async fn list_active_alerts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Alert>>, DispatchError> {
    Ok(Json(state.coordinator.active_alerts(query.limit).await?))
}

#[instrument(skip(state))]
pub async fn get_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, DispatchError> {
    Ok(Json(state.coordinator.get_alert(id).await?))
}

/// POST /alerts/:id/responses - Accept or decline an alert.
///
/// Accepting an alert another responder already acknowledged still succeeds;
/// the receipt carries `already_acknowledged` and a thank-you message.
#[instrument(skip(state, submission))]
pub async fn submit_response(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(submission): AppJson<ResponseSubmission>,
) -> Result<Json<ResponseReceipt>, DispatchError> {
    match state.coordinator.submit_response(id, submission).await {
        Ok(receipt) => {
            info!(
                alert_id = %id,
                responder_id = %receipt.response.responder_id,
                outcome = ?receipt.outcome,
                "Response recorded"
            );
            Ok(Json(receipt))
        }
        Err(e) => {
            warn!(alert_id = %id, error = %e, "Response rejected");
            Err(e)
        }
    }
}

#[instrument(skip(state))]
pub async fn list_responses(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Response>>, DispatchError> {
    Ok(Json(state.coordinator.list_responses(id).await?))
}

/// POST /alerts/:id/responses/:responder_id/progress - `{"step": "arrived"}`
/// or `{"step": "completed"}`.
#[instrument(skip(state))]
pub async fn update_progress(
    State(state): State<AppState>,
    Path((id, responder_id)): Path<(Uuid, String)>,
    AppJson(request): AppJson<ProgressRequest>,
) -> Result<Json<Response>, DispatchError> {
    let response = state
        .coordinator
        .update_progress(id, &responder_id, request.step)
        .await?;
    Ok(Json(response))
}

/// POST /alerts/:id/responses/:responder_id/rating - Requester rates a
/// completed response, 1 to 5.
#[instrument(skip(state, request))]
pub async fn rate_response(
    State(state): State<AppState>,
    Path((id, responder_id)): Path<(Uuid, String)>,
    AppJson(request): AppJson<RatingRequest>,
) -> Result<Json<Response>, DispatchError> {
    let response = state
        .coordinator
        .rate_response(
            id,
            &responder_id,
            &request.actor_id,
            request.rating,
            request.feedback,
        )
        .await?;
    Ok(Json(response))
}

/// POST /alerts/:id/cancel
#[instrument(skip(state, request))]
pub async fn cancel_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(request): AppJson<CancelRequest>,
) -> Result<Json<Transition>, DispatchError> {
    match state.coordinator.cancel(id, &request.actor_id).await {
        Ok(transition) => {
            info!(alert_id = %id, from = %transition.from, "Alert cancelled");
            Ok(Json(transition))
        }
        Err(e) => {
            warn!(alert_id = %id, error = %e, "Cancel rejected");
            Err(e)
        }
    }
}

/// POST /alerts/:id/status - `{"actor_id": "...", "status": "resolved"}`
#[instrument(skip(state, request), fields(target = %request.status))]
pub async fn update_alert_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    AppJson(request): AppJson<StatusRequest>,
) -> Result<Json<Transition>, DispatchError> {
    let transition = state
        .coordinator
        .update_alert_status(id, &request.actor_id, request.status)
        .await?;
    Ok(Json(transition))
}

/// GET /alerts/:id/eligible - Responders the alert would reach right now.
#[instrument(skip(state))]
pub async fn list_eligible_responders(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Candidate>>, DispatchError> {
    Ok(Json(state.coordinator.list_eligible_responders(id).await?))
}

/// GET /requesters/:id/alerts?status=resolved&limit=20
#[instrument(skip(state))]
pub async fn requester_history(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Alert>>, DispatchError> {
    Ok(Json(
        state
            .coordinator
            .requester_history(&requester_id, &query)
            .await?,
    ))
}

#[instrument(skip(state))]
pub async fn responder_responses(
    State(state): State<AppState>,
    Path(responder_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Response>>, DispatchError> {
    Ok(Json(
        state
            .coordinator
            .responder_responses(&responder_id, query.limit)
            .await?,
    ))
}

#[instrument(skip(state))]
pub async fn responder_stats(
    State(state): State<AppState>,
    Path(responder_id): Path<String>,
) -> Result<Json<ResponderStats>, DispatchError> {
    Ok(Json(state.coordinator.responder_stats(&responder_id).await?))
}

#[instrument(skip(state))]
pub async fn get_availability(
    State(state): State<AppState>,
    Path(responder_id): Path<String>,
) -> Result<Json<ResponderAvailability>, DispatchError> {
    Ok(Json(state.coordinator.get_availability(&responder_id).await?))
}

/// PUT /responders/:id/availability - Publish position, capabilities and
/// notification radius.
#[instrument(skip(state, update))]
pub async fn put_availability(
    State(state): State<AppState>,
    Path(responder_id): Path<String>,
    AppJson(update): AppJson<AvailabilityUpdate>,
) -> Result<Json<ResponderAvailability>, DispatchError> {
    let availability = state
        .coordinator
        .update_availability(&responder_id, update)
        .await?;
    Ok(Json(availability))
}

/// GET /subscribe/:topic - Stream `alert:{id}` or `user:{id}` events over a
/// WebSocket as JSON text frames.
///
/// The first frame is a `resync` snapshot of the alerts the topic covers.
/// Another one replaces any events the subscriber was too slow to receive.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<impl IntoResponse, DispatchError> {
    let topic: Topic = topic.parse()?;
    let subscription = state.coordinator.open_subscription(topic).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, subscription, state.coordinator)))
}

/// Pump topic frames into the socket until either side goes away.
async fn forward_events(
    socket: WebSocket,
    mut subscription: Subscription,
    coordinator: Arc<DispatchCoordinator>,
) {
    let topic = subscription.topic().clone();
    info!(topic = %topic, "Subscriber connected");
    let (mut sink, mut stream) = socket.split();

    let sender = Arc::clone(&coordinator);
    let send_task = tokio::spawn(async move {
        while let Some(frame) = sender.next_frame(&mut subscription).await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(topic = %subscription.topic(), error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!(topic = %subscription.topic(), "Subscriber sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(topic = %topic, error = %e, "Subscriber receive error");
                break;
            }
        }
    }

    send_task.abort();
    coordinator.channel().prune();
    info!(topic = %topic, "Subscriber disconnected");
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
