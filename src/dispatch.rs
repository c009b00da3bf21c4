//! DispatchCoordinator: the orchestration layer.
//!
//! The coordinator wires the store, the matcher, the notification hub and the
//! expiry scheduler together. It owns no alert state itself; every decision
//! about the lifecycle is made by [`AlertStore`]. What it adds is ordering:
//! each alert has a writer lane, and a mutation and the events it produces
//! are emitted while holding that lane, so subscribers of one alert observe
//! events in the order the store applied them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::expiry::ExpiryScheduler;
use crate::geo::GeoMatcher;
use crate::model::{
    Alert, AlertSpec, AlertStatus, AvailabilityUpdate, Candidate, HistoryQuery, ProgressStep,
    ResponderAvailability, ResponderStats, Response, ResponseReceipt, ResponseSubmission,
    SubmissionOutcome, Transition, TransitionOutcome,
};
use crate::notify::{
    Frame, MatchStatus, Notification, NotificationChannel, NotificationKind, Resync, ResyncReason,
    Topic,
};
use crate::storage::Storage;
use crate::store::{AlertStore, StorePolicy};
use crate::webhook::WebhookRelay;

/// Result of raising an alert.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub alert: Alert,
    pub candidates: Vec<Candidate>,
    pub notified_count: usize,
    pub matching: MatchStatus,
}

/// One async mutex per alert with in-flight writers.
///
/// An entry exists only while some caller holds or waits on it.
#[derive(Default)]
struct AlertLanes {
    lanes: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl AlertLanes {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<AsyncMutex<()>>>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lane(&self, alert_id: Uuid) -> Lane<'_> {
        let mutex = Arc::clone(self.lock().entry(alert_id).or_default());
        Lane {
            lanes: self,
            alert_id,
            mutex,
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A claim on one alert's lane. Dropping the last claim removes the entry.
struct Lane<'a> {
    lanes: &'a AlertLanes,
    alert_id: Uuid,
    mutex: Arc<AsyncMutex<()>>,
}

impl Lane<'_> {
    async fn lock(&self) -> AsyncMutexGuard<'_, ()> {
        self.mutex.lock().await
    }
}

impl Drop for Lane<'_> {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock();
        // Claims are only cloned under the map lock, so two references
        // (the map's and ours) means nobody else holds or awaits this lane.
        let idle = Arc::strong_count(&self.mutex) == 2
            && lanes
                .get(&self.alert_id)
                .is_some_and(|mutex| Arc::ptr_eq(mutex, &self.mutex));
        if idle {
            lanes.remove(&self.alert_id);
        }
    }
}

/// Most alerts carried by one user-topic snapshot.
const SNAPSHOT_LIMIT: u32 = 100;

/// An open subscription to one topic.
pub struct Subscription {
    topic: Topic,
    events: broadcast::Receiver<Notification>,
    pending: Option<Resync>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

pub struct DispatchCoordinator {
    store: AlertStore,
    matcher: GeoMatcher,
    channel: NotificationChannel,
    expiry: ExpiryScheduler,
    relay: Option<WebhookRelay>,
    lanes: AlertLanes,
    config: DispatchConfig,
}

impl DispatchCoordinator {
    /// Build the coordinator, start the expiry worker and re-arm deadlines
    /// for alerts left pending by a previous run.
    pub async fn start(storage: Storage, config: &DispatchConfig) -> anyhow::Result<Arc<Self>> {
        let relay = config
            .webhook_url
            .as_deref()
            .map(WebhookRelay::new)
            .transpose()?;
        if let Some(relay) = &relay {
            info!(url = relay.url(), "Webhook relay enabled");
        }

        let (expiry, fired) = ExpiryScheduler::new(config.expiry_deadline);
        let coordinator = Arc::new(Self {
            store: AlertStore::new(
                storage.clone(),
                StorePolicy {
                    description_max_chars: config.description_max_chars,
                    single_active_alert: config.single_active_alert,
                },
            ),
            matcher: GeoMatcher::new(storage, config.max_radius_m, config.geo_timeout),
            channel: NotificationChannel::new(config.channel_capacity),
            expiry,
            relay,
            lanes: AlertLanes::default(),
            config: config.clone(),
        });

        tokio::spawn(run_expiry_worker(Arc::downgrade(&coordinator), fired));
        coordinator.recover_pending().await?;

        Ok(coordinator)
    }

    /// Schedule expiry for every alert that is still pending.
    async fn recover_pending(&self) -> Result<(), DispatchError> {
        let pending = self.store.storage().list_pending_alerts().await?;
        let now = Utc::now();

        for (alert_id, created_at) in &pending {
            let elapsed = (now - *created_at).to_std().unwrap_or_default();
            let remaining = self.expiry.deadline().saturating_sub(elapsed);
            self.expiry.schedule_in(*alert_id, remaining);
        }

        if !pending.is_empty() {
            info!(count = pending.len(), "Rescheduled expiry for pending alerts");
        }
        Ok(())
    }

    /// Raw receiver for every future event on `topic`.
    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Notification> {
        self.channel.subscribe(topic)
    }

    /// Subscribe to `topic` with a snapshot of its alerts as the first frame.
    ///
    /// The receiver is attached before the snapshot is read, so no event
    /// falls between the two.
    pub async fn open_subscription(&self, topic: Topic) -> Result<Subscription, DispatchError> {
        let events = self.channel.subscribe(&topic);
        let snapshot = self.resync(&topic, ResyncReason::Connected, 0).await?;
        Ok(Subscription {
            topic,
            events,
            pending: Some(snapshot),
        })
    }

    /// Next frame for `subscription`, or `None` once it cannot continue.
    ///
    /// A subscriber that fell behind is re-attached and sent a fresh
    /// snapshot in place of the events it missed.
    pub async fn next_frame(&self, subscription: &mut Subscription) -> Option<Frame> {
        if let Some(snapshot) = subscription.pending.take() {
            return Some(Frame::Resync(snapshot));
        }

        match subscription.events.recv().await {
            Ok(notification) => Some(Frame::Event(notification)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(topic = %subscription.topic, skipped, "Subscriber lagged, resending snapshot");
                subscription.events = self.channel.subscribe(&subscription.topic);
                match self
                    .resync(&subscription.topic, ResyncReason::Lagged, skipped)
                    .await
                {
                    Ok(snapshot) => Some(Frame::Resync(snapshot)),
                    Err(e) => {
                        error!(topic = %subscription.topic, error = %e, "Could not build snapshot");
                        None
                    }
                }
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Current state of every alert `topic` covers.
    async fn resync(
        &self,
        topic: &Topic,
        reason: ResyncReason,
        skipped: u64,
    ) -> Result<Resync, DispatchError> {
        let alerts = match topic {
            Topic::Alert(alert_id) => vec![self.store.get_alert(*alert_id).await?],
            Topic::User(user_id) => {
                self.store
                    .storage()
                    .list_user_active_alerts(user_id, SNAPSHOT_LIMIT)
                    .await?
            }
        };
        Ok(Resync::new(topic, reason, skipped, alerts))
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    pub fn expiry(&self) -> &ExpiryScheduler {
        &self.expiry
    }

    /// Alerts with a writer lane currently held open.
    pub fn open_lanes(&self) -> usize {
        self.lanes.len()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Create an alert, arm its deadline and fan it out to eligible
    /// responders.
    ///
    /// A matcher timeout does not fail the call: the alert stays pending,
    /// the report says `retrying`, and matching continues in the background.
    #[instrument(skip(self, spec))]
    pub async fn create_and_dispatch(
        self: &Arc<Self>,
        spec: AlertSpec,
    ) -> Result<DispatchReport, DispatchError> {
        let alert = self.store.create_alert(spec).await?;
        self.expiry.schedule(alert.id);

        match self.matcher.find_eligible_responders(&alert).await {
            Ok(candidates) => match self
                .fan_out(&alert, &candidates, MatchStatus::Completed)
                .await
            {
                Ok(alert) => Ok(DispatchReport {
                    alert,
                    notified_count: candidates.len(),
                    candidates,
                    matching: MatchStatus::Completed,
                }),
                // The alert is stored and its deadline armed.
                Err(e) => {
                    error!(alert_id = %alert.id, error = %e, "Fan-out failed after the alert was stored");
                    Ok(DispatchReport {
                        alert,
                        candidates,
                        notified_count: 0,
                        matching: MatchStatus::Exhausted,
                    })
                }
            },
            Err(e) => {
                let matching = if e.is_retryable() && self.config.geo_retry_attempts > 0 {
                    self.spawn_match_retry(alert.clone());
                    MatchStatus::Retrying
                } else {
                    error!(alert_id = %alert.id, error = %e, "Eligible responder query failed");
                    MatchStatus::Exhausted
                };
                self.publish_summary(&alert, 0, matching).await;
                Ok(DispatchReport {
                    alert,
                    candidates: Vec::new(),
                    notified_count: 0,
                    matching,
                })
            }
        }
    }

    #[instrument(skip(self, submission), fields(responder_id = %submission.responder_id))]
    pub async fn submit_response(
        &self,
        alert_id: Uuid,
        submission: ResponseSubmission,
    ) -> Result<ResponseReceipt, DispatchError> {
        let lane = self.lanes.lane(alert_id);
        let _writer = lane.lock().await;

        let receipt = self.store.submit_response(alert_id, submission).await?;
        let alert = &receipt.alert;

        self.publish(
            &[Topic::Alert(alert.id), Topic::User(alert.requester_id.clone())],
            alert,
            NotificationKind::ResponseRecorded {
                response: receipt.response.clone(),
                outcome: receipt.outcome,
            },
        );

        if receipt.outcome == SubmissionOutcome::Acknowledged {
            self.expiry.cancel(alert_id);
            self.publish_status(AlertStatus::Pending, alert);
            info!(alert_id = %alert_id, responder_id = %receipt.response.responder_id, "Alert acknowledged");
        }

        Ok(receipt)
    }

    /// Cancel on behalf of the requester.
    #[instrument(skip(self))]
    pub async fn cancel(&self, alert_id: Uuid, actor_id: &str) -> Result<Transition, DispatchError> {
        let lane = self.lanes.lane(alert_id);
        let _writer = lane.lock().await;

        let transition = self.store.cancel(alert_id, actor_id).await?;
        self.after_transition(&transition);
        Ok(transition)
    }

    /// Move an alert to `target` on behalf of `actor_id`.
    ///
    /// The requester and any accepted responder may drive the lifecycle.
    /// Expiry is reserved to the scheduler. Targeting `cancelled` is the same
    /// command as [`cancel`](Self::cancel), with the same outcomes.
    #[instrument(skip(self))]
    pub async fn update_alert_status(
        &self,
        alert_id: Uuid,
        actor_id: &str,
        target: AlertStatus,
    ) -> Result<Transition, DispatchError> {
        if target == AlertStatus::Expired {
            return Err(DispatchError::Forbidden(
                "alerts expire only when their deadline passes".into(),
            ));
        }

        if target == AlertStatus::Cancelled {
            return self.cancel(alert_id, actor_id).await;
        }

        let alert = self.store.get_alert(alert_id).await?;
        let is_requester = alert.requester_id == actor_id;
        if !is_requester && !self.store.is_accepted_responder(alert_id, actor_id).await? {
            return Err(DispatchError::Forbidden(
                "only the requester or an accepted responder can update this alert".into(),
            ));
        }

        let lane = self.lanes.lane(alert_id);
        let _writer = lane.lock().await;

        let transition = self
            .store
            .update_status(alert_id, target, Some(actor_id))
            .await?;
        self.after_transition(&transition);
        Ok(transition)
    }

    /// Record `arrived` or `completed` for an accepted responder.
    ///
    /// The first arrival on an acknowledged alert moves it to `in_progress`.
    #[instrument(skip(self))]
    pub async fn update_progress(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        step: ProgressStep,
    ) -> Result<Response, DispatchError> {
        let lane = self.lanes.lane(alert_id);
        let _writer = lane.lock().await;

        let response = self
            .store
            .record_progress(alert_id, responder_id, step)
            .await?;
        let alert = self.store.get_alert(alert_id).await?;
        self.publish(
            &[Topic::Alert(alert.id), Topic::User(alert.requester_id.clone())],
            &alert,
            NotificationKind::ResponseUpdated {
                response: response.clone(),
            },
        );

        if step == ProgressStep::Arrived && alert.status() == AlertStatus::Acknowledged {
            match self
                .store
                .update_status(alert_id, AlertStatus::InProgress, Some(responder_id))
                .await
            {
                Ok(transition) => self.after_transition(&transition),
                Err(DispatchError::StateConflict(reason)) => {
                    debug!(alert_id = %alert_id, reason = %reason, "Alert moved on before arrival");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(response)
    }

    #[instrument(skip(self, feedback))]
    pub async fn rate_response(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        actor_id: &str,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<Response, DispatchError> {
        let lane = self.lanes.lane(alert_id);
        let _writer = lane.lock().await;

        let response = self
            .store
            .rate_response(alert_id, responder_id, actor_id, rating, feedback)
            .await?;
        let alert = self.store.get_alert(alert_id).await?;
        self.publish(
            &[
                Topic::Alert(alert.id),
                Topic::User(response.responder_id.clone()),
            ],
            &alert,
            NotificationKind::ResponseUpdated {
                response: response.clone(),
            },
        );
        info!(alert_id = %alert_id, responder_id, rating, "Response rated");

        Ok(response)
    }

    /// Expire an alert whose deadline passed. A no-op unless still pending.
    pub async fn expire(&self, alert_id: Uuid) -> Result<Option<Alert>, DispatchError> {
        let lane = self.lanes.lane(alert_id);
        let _writer = lane.lock().await;

        let Some(alert) = self.store.expire(alert_id).await? else {
            debug!(alert_id = %alert_id, "Deadline reached after alert left pending");
            return Ok(None);
        };
        self.publish_status(AlertStatus::Pending, &alert);
        Ok(Some(alert))
    }

    pub async fn update_availability(
        &self,
        responder_id: &str,
        update: AvailabilityUpdate,
    ) -> Result<ResponderAvailability, DispatchError> {
        let availability = update.into_availability(
            responder_id,
            self.config.max_radius_m,
            self.config.default_radius_m,
            Utc::now(),
        )?;
        self.store
            .storage()
            .upsert_availability(&availability)
            .await?;
        debug!(
            responder_id,
            is_available = availability.is_available,
            radius_m = availability.notification_radius_m,
            "Availability updated"
        );
        Ok(availability)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_alert(&self, alert_id: Uuid) -> Result<Alert, DispatchError> {
        self.store.get_alert(alert_id).await
    }

    pub async fn list_responses(&self, alert_id: Uuid) -> Result<Vec<Response>, DispatchError> {
        self.store.list_responses(alert_id).await
    }

    pub async fn list_eligible_responders(
        &self,
        alert_id: Uuid,
    ) -> Result<Vec<Candidate>, DispatchError> {
        let alert = self.store.get_alert(alert_id).await?;
        self.matcher.find_eligible_responders(&alert).await
    }

    pub async fn active_alerts(&self, limit: u32) -> Result<Vec<Alert>, DispatchError> {
        Ok(self.store.storage().list_active_alerts(limit).await?)
    }

    pub async fn requester_history(
        &self,
        requester_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<Alert>, DispatchError> {
        Ok(self
            .store
            .storage()
            .list_requester_alerts(requester_id, query.status, query.limit)
            .await?)
    }

    pub async fn responder_responses(
        &self,
        responder_id: &str,
        limit: u32,
    ) -> Result<Vec<Response>, DispatchError> {
        Ok(self
            .store
            .storage()
            .list_responder_responses(responder_id, limit)
            .await?)
    }

    pub async fn responder_stats(&self, responder_id: &str) -> Result<ResponderStats, DispatchError> {
        Ok(self.store.storage().responder_stats(responder_id).await?)
    }

    pub async fn get_availability(
        &self,
        responder_id: &str,
    ) -> Result<ResponderAvailability, DispatchError> {
        self.store
            .storage()
            .get_availability(responder_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("responder", responder_id))
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Notify `candidates` about `alert` and publish the dispatch summary.
    ///
    /// A candidate whose notification cannot be recorded is still notified.
    /// Returns the alert reloaded with its notified set.
    async fn fan_out(
        &self,
        alert: &Alert,
        candidates: &[Candidate],
        matching: MatchStatus,
    ) -> Result<Alert, DispatchError> {
        let lane = self.lanes.lane(alert.id);
        let _writer = lane.lock().await;

        let current = self.store.get_alert(alert.id).await?;
        if current.status() != AlertStatus::Pending {
            debug!(alert_id = %alert.id, status = %current.status(), "Skipping fan-out");
            return Ok(current);
        }

        let now = Utc::now();
        for candidate in candidates {
            if let Err(e) = self
                .store
                .storage()
                .record_notification(alert.id, candidate, now)
                .await
            {
                warn!(
                    alert_id = %alert.id,
                    responder_id = %candidate.responder_id,
                    error = %e,
                    "Failed to record notification"
                );
            }

            let topic = Topic::User(candidate.responder_id.clone());
            let notification = Notification::new(
                &topic,
                &current,
                NotificationKind::AlertRaised {
                    alert: current.clone(),
                    distance_m: candidate.distance_m,
                },
            );
            if let Some(relay) = &self.relay {
                spawn_relay(relay.clone(), candidate.responder_id.clone(), notification.clone());
            }
            self.channel.send(&topic, notification);
        }

        let alert = match self.store.get_alert(alert.id).await {
            Ok(alert) => alert,
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Could not reload alert after fan-out");
                current
            }
        };
        self.publish(
            &[Topic::Alert(alert.id), Topic::User(alert.requester_id.clone())],
            &alert,
            NotificationKind::DispatchSummary {
                notified_count: candidates.len(),
                matching,
            },
        );

        info!(
            alert_id = %alert.id,
            notified = candidates.len(),
            "Alert dispatched"
        );
        Ok(alert)
    }

    fn spawn_match_retry(self: &Arc<Self>, alert: Alert) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.retry_matching(alert).await });
    }

    async fn retry_matching(&self, alert: Alert) {
        let mut delay = self.config.geo_retry_base_delay;

        for attempt in 1..=self.config.geo_retry_attempts {
            tokio::time::sleep(delay).await;
            match self.matcher.find_eligible_responders(&alert).await {
                Ok(candidates) => {
                    if let Err(e) = self
                        .fan_out(&alert, &candidates, MatchStatus::Completed)
                        .await
                    {
                        error!(alert_id = %alert.id, error = %e, "Fan-out after retry failed");
                    }
                    return;
                }
                Err(e) => {
                    warn!(alert_id = %alert.id, attempt, error = %e, "Matching retry failed");
                }
            }
            delay = delay.saturating_mul(2);
        }

        error!(alert_id = %alert.id, "Giving up on matching");
        self.publish_summary(&alert, 0, MatchStatus::Exhausted).await;
    }

    async fn publish_summary(&self, alert: &Alert, notified_count: usize, matching: MatchStatus) {
        let lane = self.lanes.lane(alert.id);
        let _writer = lane.lock().await;

        let current = match self.store.get_alert(alert.id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Could not reload alert for summary");
                alert.clone()
            }
        };
        self.publish(
            &[
                Topic::Alert(current.id),
                Topic::User(current.requester_id.clone()),
            ],
            &current,
            NotificationKind::DispatchSummary {
                notified_count,
                matching,
            },
        );
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    fn publish(&self, topics: &[Topic], alert: &Alert, kind: NotificationKind) {
        for topic in topics {
            self.channel.publish(topic, alert, kind.clone());
        }
    }

    /// Emit `status_changed` for a transition that just landed.
    ///
    /// Terminal changes also reach every notified responder.
    fn publish_status(&self, from: AlertStatus, alert: &Alert) {
        let mut topics = vec![
            Topic::Alert(alert.id),
            Topic::User(alert.requester_id.clone()),
        ];
        if alert.is_terminal() {
            topics.extend(
                alert
                    .notified_responder_ids
                    .iter()
                    .map(|id| Topic::User(id.clone())),
            );
        }

        self.publish(
            &topics,
            alert,
            NotificationKind::StatusChanged {
                from,
                to: alert.status(),
                alert: alert.clone(),
            },
        );
    }

    fn after_transition(&self, transition: &Transition) {
        if transition.outcome == TransitionOutcome::AlreadyInState {
            return;
        }
        let alert = &transition.alert;
        if transition.from == AlertStatus::Pending {
            self.expiry.cancel(alert.id);
        }
        self.publish_status(transition.from, alert);
    }
}

fn spawn_relay(relay: WebhookRelay, recipient_id: String, notification: Notification) {
    tokio::spawn(async move {
        if let Err(e) = relay.deliver(&recipient_id, &notification).await {
            warn!(
                recipient_id = %recipient_id,
                alert_id = %notification.alert_id,
                error = %e,
                "Webhook delivery failed"
            );
        }
    });
}

/// Consume fired deadlines until the coordinator is dropped.
async fn run_expiry_worker(coordinator: Weak<DispatchCoordinator>, mut fired: mpsc::UnboundedReceiver<Uuid>) {
    while let Some(alert_id) = fired.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        if let Err(e) = coordinator.expire(alert_id).await {
            warn!(alert_id = %alert_id, error = %e, "Failed to expire alert");
        }
    }
    debug!("Expiry worker stopped");
}
