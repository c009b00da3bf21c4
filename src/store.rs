//! AlertStore: the authoritative owner of alerts and responses.
//!
//! All lifecycle rules live here. Callers never write alert fields directly;
//! they ask for a transition and receive a definite outcome. Concurrency is
//! resolved by the storage-level CAS on the status column: readers take a
//! snapshot, validate the edge against it, and write only if the status is
//! still the one they saw.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::model::{
    Alert, AlertSpec, AlertStatus, ProgressStep, Response, ResponseReceipt,
    ResponseSubmission, SubmissionOutcome, Transition, TransitionOutcome,
};
use crate::storage::Storage;

/// Upper bound on optimistic retries. Statuses only move forward, so a
/// transition loop can observe at most this many distinct states.
const MAX_CAS_ATTEMPTS: usize = 4;

/// Policies applied when alerts are created.
#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub description_max_chars: usize,
    pub single_active_alert: bool,
}

#[derive(Clone)]
pub struct AlertStore {
    storage: Storage,
    policy: StorePolicy,
}

impl AlertStore {
    pub fn new(storage: Storage, policy: StorePolicy) -> Self {
        Self { storage, policy }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Validate `spec` and store it as a new pending alert.
    pub async fn create_alert(&self, spec: AlertSpec) -> Result<Alert, DispatchError> {
        let alert = spec.into_alert(self.policy.description_max_chars, Utc::now())?;

        let inserted = self
            .storage
            .insert_alert(&alert, self.policy.single_active_alert)
            .await?;
        if !inserted {
            return Err(DispatchError::StateConflict(
                "requester already has an active alert".into(),
            ));
        }

        info!(
            alert_id = %alert.id,
            emergency_type = %alert.emergency_type,
            urgency = alert.urgency.as_str(),
            "Alert created"
        );
        Ok(alert)
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Alert, DispatchError> {
        self.storage
            .get_alert(id)
            .await?
            .ok_or_else(|| DispatchError::not_found("alert", id))
    }

    /// Record a responder's decision and, for the first acceptance of a
    /// pending alert, acknowledge it.
    ///
    /// Exactly one of any number of concurrent acceptances observes
    /// [`SubmissionOutcome::Acknowledged`]; the others are still recorded and
    /// observe [`SubmissionOutcome::AlreadyAcknowledged`].
    pub async fn submit_response(
        &self,
        alert_id: Uuid,
        submission: ResponseSubmission,
    ) -> Result<ResponseReceipt, DispatchError> {
        let now = Utc::now();
        let response = submission.into_response(alert_id, now)?;

        let Some(response) = self.storage.upsert_response(&response).await? else {
            let alert = self.get_alert(alert_id).await?;
            return Err(DispatchError::already(alert.status()));
        };

        if !response.is_accepted() {
            let alert = self.get_alert(alert_id).await?;
            return Ok(receipt(response, alert, SubmissionOutcome::Recorded));
        }

        let snapshot = self.get_alert(alert_id).await?;
        let outcome = match snapshot.status() {
            AlertStatus::Pending => {
                let acknowledged = snapshot
                    .state
                    .advance(AlertStatus::Acknowledged, now, None)
                    .ok_or(DispatchError::InvalidTransition {
                        from: AlertStatus::Pending,
                        to: AlertStatus::Acknowledged,
                    })?;
                if self
                    .storage
                    .compare_and_set_status(alert_id, AlertStatus::Pending, &acknowledged)
                    .await?
                {
                    SubmissionOutcome::Acknowledged
                } else {
                    SubmissionOutcome::AlreadyAcknowledged
                }
            }
            AlertStatus::Acknowledged | AlertStatus::InProgress => {
                SubmissionOutcome::AlreadyAcknowledged
            }
            terminal => return Err(DispatchError::already(terminal)),
        };

        let alert = self.get_alert(alert_id).await?;
        if outcome == SubmissionOutcome::AlreadyAcknowledged && alert.is_terminal() {
            // Lost to a cancellation or expiry rather than another acceptance.
            return Err(DispatchError::already(alert.status()));
        }

        debug!(
            alert_id = %alert_id,
            responder_id = %response.responder_id,
            outcome = ?outcome,
            "Acceptance applied"
        );
        Ok(receipt(response, alert, outcome))
    }

    /// Move an alert along one lifecycle edge.
    ///
    /// An edge that is invalid from the first observed status fails with
    /// [`DispatchError::InvalidTransition`]. If the edge was valid but
    /// another actor moved the alert first, the call re-evaluates against the
    /// new status and fails with [`DispatchError::StateConflict`] if the edge
    /// is no longer available.
    pub async fn update_status(
        &self,
        alert_id: Uuid,
        target: AlertStatus,
        actor: Option<&str>,
    ) -> Result<Transition, DispatchError> {
        let mut first_attempt = true;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_alert(alert_id).await?;
            let from = current.status();

            if from == target {
                return Ok(Transition {
                    alert: current,
                    from,
                    outcome: TransitionOutcome::AlreadyInState,
                });
            }

            let Some(next) = current.state.advance(target, Utc::now(), actor) else {
                if first_attempt && !from.can_transition_to(target) {
                    return Err(DispatchError::InvalidTransition { from, to: target });
                }
                if from.can_transition_to(target) {
                    return Err(DispatchError::Validation(format!(
                        "an actor is required to move an alert to {target}"
                    )));
                }
                return Err(DispatchError::already(from));
            };

            if self
                .storage
                .compare_and_set_status(alert_id, from, &next)
                .await?
            {
                let alert = self.get_alert(alert_id).await?;
                info!(alert_id = %alert_id, from = %from, to = %target, "Alert transitioned");
                return Ok(Transition {
                    alert,
                    from,
                    outcome: TransitionOutcome::Transitioned,
                });
            }

            debug!(alert_id = %alert_id, from = %from, to = %target, "Lost status race, re-reading");
            first_attempt = false;
        }

        let alert = self.get_alert(alert_id).await?;
        Err(DispatchError::already(alert.status()))
    }

    /// Cancel an alert on behalf of its requester.
    pub async fn cancel(&self, alert_id: Uuid, actor_id: &str) -> Result<Transition, DispatchError> {
        let alert = self.get_alert(alert_id).await?;
        if alert.requester_id != actor_id {
            return Err(DispatchError::Forbidden(
                "only the requester can cancel an alert".into(),
            ));
        }
        if alert.is_terminal() {
            return Err(DispatchError::already(alert.status()));
        }

        let transition = self
            .update_status(alert_id, AlertStatus::Cancelled, Some(actor_id))
            .await?;
        if transition.outcome == TransitionOutcome::AlreadyInState {
            // A concurrent cancel won.
            return Err(DispatchError::already(AlertStatus::Cancelled));
        }
        Ok(transition)
    }

    /// Expire an alert that is still pending.
    ///
    /// Returns `None` when the alert already left `pending`.
    pub async fn expire(&self, alert_id: Uuid) -> Result<Option<Alert>, DispatchError> {
        let current = self.get_alert(alert_id).await?;
        if current.status() != AlertStatus::Pending {
            return Ok(None);
        }

        let Some(expired) = current.state.advance(AlertStatus::Expired, Utc::now(), None) else {
            return Ok(None);
        };
        if !self
            .storage
            .compare_and_set_status(alert_id, AlertStatus::Pending, &expired)
            .await?
        {
            return Ok(None);
        }

        info!(alert_id = %alert_id, "Alert expired");
        self.get_alert(alert_id).await.map(Some)
    }

    /// Record a progress step for an accepted response.
    pub async fn record_progress(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        step: ProgressStep,
    ) -> Result<Response, DispatchError> {
        let now = Utc::now();
        let updated = match step {
            ProgressStep::Arrived => self.storage.mark_arrived(alert_id, responder_id, now).await?,
            ProgressStep::Completed => {
                self.storage
                    .mark_completed(alert_id, responder_id, now)
                    .await?
            }
        };

        let alert = self.get_alert(alert_id).await?;
        let response = self
            .storage
            .get_response(alert_id, responder_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("response", responder_id))?;

        if updated {
            return Ok(response);
        }

        if alert.is_terminal() {
            return Err(DispatchError::already(alert.status()));
        }
        if !response.is_accepted() {
            return Err(DispatchError::StateConflict(
                "only accepted responses can report progress".into(),
            ));
        }
        if response.completed_at().is_some() {
            return Err(DispatchError::StateConflict("response already completed".into()));
        }
        Err(DispatchError::StateConflict(
            "responder already marked as arrived".into(),
        ))
    }

    /// Rate a completed response, once, on behalf of the requester.
    pub async fn rate_response(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        actor_id: &str,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<Response, DispatchError> {
        if !(1..=5).contains(&rating) {
            return Err(DispatchError::Validation("rating must be between 1 and 5".into()));
        }
        let feedback = feedback
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());

        let alert = self.get_alert(alert_id).await?;
        if alert.requester_id != actor_id {
            return Err(DispatchError::Forbidden(
                "only the requester can rate a response".into(),
            ));
        }

        let rated = self
            .storage
            .set_rating(alert_id, responder_id, rating, feedback.as_deref())
            .await?;
        let response = self
            .storage
            .get_response(alert_id, responder_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("response", responder_id))?;

        if rated {
            return Ok(response);
        }
        if response.completed_at().is_none() {
            return Err(DispatchError::StateConflict(
                "a response can only be rated after it is completed".into(),
            ));
        }
        Err(DispatchError::StateConflict("response already rated".into()))
    }

    pub async fn list_responses(&self, alert_id: Uuid) -> Result<Vec<Response>, DispatchError> {
        self.get_alert(alert_id).await?;
        Ok(self.storage.list_responses(alert_id).await?)
    }

    /// Whether `actor_id` holds an accepted response on `alert_id`.
    pub async fn is_accepted_responder(
        &self,
        alert_id: Uuid,
        actor_id: &str,
    ) -> Result<bool, DispatchError> {
        Ok(self
            .storage
            .get_response(alert_id, actor_id)
            .await?
            .is_some_and(|r| r.is_accepted()))
    }
}

fn receipt(response: Response, alert: Alert, outcome: SubmissionOutcome) -> ResponseReceipt {
    ResponseReceipt {
        response,
        alert,
        outcome,
        message: outcome.message(),
    }
}
