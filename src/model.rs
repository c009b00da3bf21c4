//! Data models for Lifeline.
//!
//! # Lifecycle
//!
//! An [`Alert`] moves through a fixed graph of statuses:
//!
//! ```text
//! pending ──► acknowledged ──► in_progress ──► resolved
//!    │  │           │               │
//!    │  └─► expired └──► cancelled ◄┘
//!    └──────────────────► cancelled
//! ```
//!
//! `resolved`, `cancelled` and `expired` are terminal. The per-status data
//! lives in [`AlertState`], so a pending alert simply has no `resolved_at`
//! to get wrong.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Maximum length of an alert title, in characters.
pub const TITLE_MAX_CHARS: usize = 200;

/// Maximum length of a response message, in characters.
pub const MESSAGE_MAX_CHARS: usize = 500;

/// Upper bound on a responder's estimated arrival, in minutes.
pub const MAX_ETA_MINUTES: u32 = 24 * 60;

/// Kind of emergency an alert reports.
///
/// Responders advertise the kinds they can handle as capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyType {
    Medical,
    Fire,
    Accident,
    Security,
    Natural,
    Other,
}

impl EmergencyType {
    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyType::Medical => "medical",
            EmergencyType::Fire => "fire",
            EmergencyType::Accident => "accident",
            EmergencyType::Security => "security",
            EmergencyType::Natural => "natural",
            EmergencyType::Other => "other",
        }
    }
}

impl FromStr for EmergencyType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medical" => Ok(EmergencyType::Medical),
            "fire" => Ok(EmergencyType::Fire),
            "accident" => Ok(EmergencyType::Accident),
            "security" => Ok(EmergencyType::Security),
            "natural" => Ok(EmergencyType::Natural),
            "other" => Ok(EmergencyType::Other),
            _ => Err(DispatchError::Validation(format!(
                "unknown emergency type '{s}'"
            ))),
        }
    }
}

impl fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently the requester needs help.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Critical => "critical",
            Urgency::High => "high",
            Urgency::Medium => "medium",
            Urgency::Low => "low",
        }
    }
}

impl FromStr for Urgency {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Urgency::Critical),
            "high" => Ok(Urgency::High),
            "medium" => Ok(Urgency::Medium),
            "low" => Ok(Urgency::Low),
            _ => Err(DispatchError::Validation(format!("unknown urgency '{s}'"))),
        }
    }
}

/// A point on the earth, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, DispatchError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DispatchError::Validation(format!(
                "latitude {latitude} is out of range"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DispatchError::Validation(format!(
                "longitude {longitude} is out of range"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Where the requester needs help.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
}

impl Location {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Flat status discriminant, as stored and compared by the CAS primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Acknowledged,
    InProgress,
    Resolved,
    Cancelled,
    Expired,
}

impl AlertStatus {
    /// Statuses from which the alert can still move.
    pub const ACTIVE: [AlertStatus; 3] = [
        AlertStatus::Pending,
        AlertStatus::Acknowledged,
        AlertStatus::InProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::InProgress => "in_progress",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Cancelled => "cancelled",
            AlertStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AlertStatus::Resolved | AlertStatus::Cancelled | AlertStatus::Expired
        )
    }

    /// Position in the lifecycle. Transitions only ever increase it.
    pub fn rank(self) -> u8 {
        match self {
            AlertStatus::Pending => 0,
            AlertStatus::Acknowledged => 1,
            AlertStatus::InProgress => 2,
            AlertStatus::Resolved | AlertStatus::Cancelled | AlertStatus::Expired => 3,
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Pending, Acknowledged)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Acknowledged, InProgress)
                | (Acknowledged, Cancelled)
                | (InProgress, Resolved)
                | (InProgress, Cancelled)
        )
    }
}

impl FromStr for AlertStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "in_progress" => Ok(AlertStatus::InProgress),
            "resolved" => Ok(AlertStatus::Resolved),
            "cancelled" => Ok(AlertStatus::Cancelled),
            "expired" => Ok(AlertStatus::Expired),
            _ => Err(DispatchError::Validation(format!("unknown status '{s}'"))),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status together with the data that is only meaningful in that status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AlertState {
    Pending,
    Acknowledged {
        acknowledged_at: DateTime<Utc>,
    },
    InProgress {
        acknowledged_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
    },
    Resolved {
        acknowledged_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
    },
    Cancelled {
        acknowledged_at: Option<DateTime<Utc>>,
        started_at: Option<DateTime<Utc>>,
        cancelled_by: String,
        resolved_at: DateTime<Utc>,
    },
    Expired {
        resolved_at: DateTime<Utc>,
    },
}

/// Column-level view of an [`AlertState`], as persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateColumns {
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
}

impl AlertState {
    pub fn status(&self) -> AlertStatus {
        match self {
            AlertState::Pending => AlertStatus::Pending,
            AlertState::Acknowledged { .. } => AlertStatus::Acknowledged,
            AlertState::InProgress { .. } => AlertStatus::InProgress,
            AlertState::Resolved { .. } => AlertStatus::Resolved,
            AlertState::Cancelled { .. } => AlertStatus::Cancelled,
            AlertState::Expired { .. } => AlertStatus::Expired,
        }
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AlertState::Resolved { resolved_at, .. }
            | AlertState::Cancelled { resolved_at, .. }
            | AlertState::Expired { resolved_at } => Some(*resolved_at),
            _ => None,
        }
    }

    pub fn acknowledged_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AlertState::Acknowledged { acknowledged_at }
            | AlertState::InProgress {
                acknowledged_at, ..
            }
            | AlertState::Resolved {
                acknowledged_at, ..
            } => Some(*acknowledged_at),
            AlertState::Cancelled {
                acknowledged_at, ..
            } => *acknowledged_at,
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AlertState::InProgress { started_at, .. } | AlertState::Resolved { started_at, .. } => {
                Some(*started_at)
            }
            AlertState::Cancelled { started_at, .. } => *started_at,
            _ => None,
        }
    }

    /// Build the state reached by taking the edge `self -> next` at `at`.
    ///
    /// Returns `None` when `next` is not adjacent to the current status, or
    /// when a cancellation carries no actor.
    pub fn advance(
        &self,
        next: AlertStatus,
        at: DateTime<Utc>,
        actor: Option<&str>,
    ) -> Option<AlertState> {
        if !self.status().can_transition_to(next) {
            return None;
        }
        let state = match next {
            AlertStatus::Acknowledged => AlertState::Acknowledged {
                acknowledged_at: at,
            },
            AlertStatus::InProgress => AlertState::InProgress {
                acknowledged_at: self.acknowledged_at()?,
                started_at: at,
            },
            AlertStatus::Resolved => AlertState::Resolved {
                acknowledged_at: self.acknowledged_at()?,
                started_at: self.started_at()?,
                resolved_at: at,
            },
            AlertStatus::Cancelled => AlertState::Cancelled {
                acknowledged_at: self.acknowledged_at(),
                started_at: self.started_at(),
                cancelled_by: actor?.to_string(),
                resolved_at: at,
            },
            AlertStatus::Expired => AlertState::Expired { resolved_at: at },
            AlertStatus::Pending => return None,
        };
        Some(state)
    }

    pub fn columns(&self) -> StateColumns {
        StateColumns {
            acknowledged_at: self.acknowledged_at(),
            started_at: self.started_at(),
            resolved_at: self.resolved_at(),
            cancelled_by: match self {
                AlertState::Cancelled { cancelled_by, .. } => Some(cancelled_by.clone()),
                _ => None,
            },
        }
    }

    /// Rebuild a state from its persisted columns.
    ///
    /// Returns `None` if the columns are inconsistent with `status`.
    pub fn from_columns(status: AlertStatus, columns: StateColumns) -> Option<AlertState> {
        let StateColumns {
            acknowledged_at,
            started_at,
            resolved_at,
            cancelled_by,
        } = columns;
        match status {
            AlertStatus::Pending => (acknowledged_at.is_none() && resolved_at.is_none())
                .then_some(AlertState::Pending),
            AlertStatus::Acknowledged => {
                if resolved_at.is_some() {
                    return None;
                }
                Some(AlertState::Acknowledged {
                    acknowledged_at: acknowledged_at?,
                })
            }
            AlertStatus::InProgress => {
                if resolved_at.is_some() {
                    return None;
                }
                Some(AlertState::InProgress {
                    acknowledged_at: acknowledged_at?,
                    started_at: started_at?,
                })
            }
            AlertStatus::Resolved => Some(AlertState::Resolved {
                acknowledged_at: acknowledged_at?,
                started_at: started_at?,
                resolved_at: resolved_at?,
            }),
            AlertStatus::Cancelled => Some(AlertState::Cancelled {
                acknowledged_at,
                started_at,
                cancelled_by: cancelled_by?,
                resolved_at: resolved_at?,
            }),
            AlertStatus::Expired => Some(AlertState::Expired {
                resolved_at: resolved_at?,
            }),
        }
    }
}

/// A single emergency request, tracked to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub requester_id: String,
    pub emergency_type: EmergencyType,
    pub urgency: Urgency,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Location,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: AlertState,
    /// Bumped by every status transition; subscribers de-duplicate on it.
    pub version: i64,
    /// Responders a fan-out notification was issued to.
    #[serde(default)]
    pub notified_responder_ids: BTreeSet<String>,
}

impl Alert {
    pub fn status(&self) -> AlertStatus {
        self.state.status()
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.state.resolved_at()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Request body for creating an alert.
///
/// Every field is optional at the wire level so that missing or malformed
/// input is reported as a validation error instead of a decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertSpec {
    pub requester_id: Option<String>,
    pub emergency_type: Option<String>,
    pub urgency: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<LocationInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationInput {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
}

impl AlertSpec {
    /// Check required fields and bounds, producing a fresh pending alert.
    pub fn into_alert(self, description_max: usize, now: DateTime<Utc>) -> Result<Alert, DispatchError> {
        let requester_id = non_blank(self.requester_id)
            .ok_or_else(|| DispatchError::Validation("requester_id is required".into()))?;

        let emergency_type: EmergencyType = self
            .emergency_type
            .as_deref()
            .ok_or_else(|| DispatchError::Validation("emergency_type is required".into()))?
            .parse()?;

        let urgency = match self.urgency.as_deref() {
            Some(u) => u.parse()?,
            None => Urgency::default(),
        };

        let location = self
            .location
            .ok_or_else(|| DispatchError::Validation("location is required".into()))?;
        let (Some(latitude), Some(longitude)) = (location.latitude, location.longitude) else {
            return Err(DispatchError::Validation(
                "location requires latitude and longitude".into(),
            ));
        };
        let point = GeoPoint::new(latitude, longitude)?;

        let title = non_blank(self.title);
        if let Some(title) = &title {
            check_len("title", title, TITLE_MAX_CHARS)?;
        }
        let description = non_blank(self.description);
        if let Some(description) = &description {
            check_len("description", description, description_max)?;
        }

        Ok(Alert {
            id: Uuid::new_v4(),
            requester_id,
            emergency_type,
            urgency,
            title,
            description,
            location: Location {
                latitude: point.latitude,
                longitude: point.longitude,
                address: non_blank(location.address),
            },
            created_at: now,
            state: AlertState::Pending,
            version: 1,
            notified_responder_ids: BTreeSet::new(),
        })
    }
}

/// A responder's answer to a fan-out notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accepted,
    Declined,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::Declined => "declined",
        }
    }
}

impl FromStr for Decision {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Decision::Accepted),
            "declined" => Ok(Decision::Declined),
            _ => Err(DispatchError::Validation(format!("unknown decision '{s}'"))),
        }
    }
}

/// Decision plus the progress data that only an accepted response carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ResponseDecision {
    Declined,
    Accepted {
        estimated_arrival_minutes: Option<u32>,
        arrived_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        rating: Option<u8>,
        feedback: Option<String>,
    },
}

impl ResponseDecision {
    pub fn decision(&self) -> Decision {
        match self {
            ResponseDecision::Declined => Decision::Declined,
            ResponseDecision::Accepted { .. } => Decision::Accepted,
        }
    }
}

/// One responder's decision and progress against one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub responder_id: String,
    pub submitted_at: DateTime<Utc>,
    pub message: Option<String>,
    #[serde(flatten)]
    pub decision: ResponseDecision,
}

impl Response {
    pub fn is_accepted(&self) -> bool {
        matches!(self.decision, ResponseDecision::Accepted { .. })
    }

    pub fn arrived_at(&self) -> Option<DateTime<Utc>> {
        match &self.decision {
            ResponseDecision::Accepted { arrived_at, .. } => *arrived_at,
            ResponseDecision::Declined => None,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.decision {
            ResponseDecision::Accepted { completed_at, .. } => *completed_at,
            ResponseDecision::Declined => None,
        }
    }

    pub fn rating(&self) -> Option<u8> {
        match &self.decision {
            ResponseDecision::Accepted { rating, .. } => *rating,
            ResponseDecision::Declined => None,
        }
    }
}

/// Request body for submitting a response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseSubmission {
    pub responder_id: String,
    pub decision: Decision,
    pub estimated_arrival_minutes: Option<u32>,
    pub message: Option<String>,
}

impl ResponseSubmission {
    pub fn into_response(self, alert_id: Uuid, now: DateTime<Utc>) -> Result<Response, DispatchError> {
        let responder_id = non_blank(Some(self.responder_id))
            .ok_or_else(|| DispatchError::Validation("responder_id is required".into()))?;
        let message = non_blank(self.message);
        if let Some(message) = &message {
            check_len("message", message, MESSAGE_MAX_CHARS)?;
        }
        if let Some(eta) = self.estimated_arrival_minutes {
            if eta > MAX_ETA_MINUTES {
                return Err(DispatchError::Validation(format!(
                    "estimated_arrival_minutes must be at most {MAX_ETA_MINUTES}"
                )));
            }
        }
        let decision = match self.decision {
            Decision::Declined => ResponseDecision::Declined,
            Decision::Accepted => ResponseDecision::Accepted {
                estimated_arrival_minutes: self.estimated_arrival_minutes,
                arrived_at: None,
                completed_at: None,
                rating: None,
                feedback: None,
            },
        };
        Ok(Response {
            id: Uuid::new_v4(),
            alert_id,
            responder_id,
            submitted_at: now,
            message,
            decision,
        })
    }
}

/// What a response submission did to the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// This submission performed the `pending -> acknowledged` transition.
    Acknowledged,
    /// Accepted, but another acceptance had already acknowledged the alert.
    AlreadyAcknowledged,
    /// Recorded without any status effect (e.g. declined).
    Recorded,
}

impl SubmissionOutcome {
    /// Text shown to the responder.
    pub fn message(self) -> &'static str {
        match self {
            SubmissionOutcome::Acknowledged => "you are now coordinating with the requester",
            SubmissionOutcome::AlreadyAcknowledged => "alert already being handled, thank you",
            SubmissionOutcome::Recorded => "response recorded",
        }
    }
}

/// Result of [`ResponseSubmission`] handling.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseReceipt {
    pub response: Response,
    pub alert: Alert,
    pub outcome: SubmissionOutcome,
    pub message: &'static str,
}

/// Whether a transition request changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Transitioned,
    AlreadyInState,
}

/// Result of a status transition request.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub alert: Alert,
    pub from: AlertStatus,
    pub outcome: TransitionOutcome,
}

/// Progress step reported by an accepted responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStep {
    Arrived,
    Completed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressRequest {
    pub step: ProgressStep,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RatingRequest {
    pub actor_id: String,
    pub rating: u8,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub actor_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub actor_id: String,
    pub status: AlertStatus,
}

/// A responder's advertised availability. Written only by that responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderAvailability {
    pub responder_id: String,
    pub is_available: bool,
    pub location: GeoPoint,
    pub capabilities: BTreeSet<EmergencyType>,
    /// How far away an alert may be and still reach this responder.
    pub notification_radius_m: f64,
    pub last_updated: DateTime<Utc>,
}

/// Request body for updating availability and location preferences.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityUpdate {
    pub is_available: bool,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub capabilities: Vec<EmergencyType>,
    pub notification_radius_m: Option<f64>,
}

impl AvailabilityUpdate {
    pub fn into_availability(
        self,
        responder_id: &str,
        max_radius_m: f64,
        default_radius_m: f64,
        now: DateTime<Utc>,
    ) -> Result<ResponderAvailability, DispatchError> {
        let responder_id = non_blank(Some(responder_id.to_string()))
            .ok_or_else(|| DispatchError::Validation("responder_id is required".into()))?;
        let location = GeoPoint::new(self.latitude, self.longitude)?;
        let radius = self.notification_radius_m.unwrap_or(default_radius_m);
        if !radius.is_finite() || radius <= 0.0 || radius > max_radius_m {
            return Err(DispatchError::Validation(format!(
                "notification_radius_m must be in (0, {max_radius_m}]"
            )));
        }
        Ok(ResponderAvailability {
            responder_id,
            is_available: self.is_available,
            location,
            capabilities: self.capabilities.into_iter().collect(),
            notification_radius_m: radius,
            last_updated: now,
        })
    }
}

/// A responder selected by the matcher, with their distance to the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub responder_id: String,
    pub distance_m: f64,
    pub last_updated: DateTime<Utc>,
}

/// Aggregate figures for one responder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponderStats {
    pub responder_id: String,
    pub total_responses: i64,
    pub accepted_responses: i64,
    pub completed_responses: i64,
    /// Mean seconds from alert creation to an accepted response.
    pub average_response_secs: Option<f64>,
    pub average_rating: Option<f64>,
}

/// Query parameters for a requester's alert history.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub status: Option<AlertStatus>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

/// Query parameters for list endpoints.
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), DispatchError> {
    if value.chars().count() > max {
        return Err(DispatchError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}
