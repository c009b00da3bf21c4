//! In-process publish/subscribe hub for lifecycle events.
//!
//! Topics come in two shapes: `alert:{id}` carries status and response
//! events for one alert, `user:{id}` carries everything relevant to one
//! requester or responder. Each topic is a `tokio::sync::broadcast` channel
//! created on first subscription and dropped once it has no receivers.
//!
//! Subscribers never silently miss a change. A subscription opens with a
//! [`Resync`] snapshot of every alert its topic covers, and a subscriber that
//! falls behind the buffer is sent a fresh snapshot in place of the dropped
//! events. A snapshot and the events around it may overlap, so clients
//! de-duplicate: an event whose `alert_version` is not above the version
//! they already hold for that alert is stale.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::model::{Alert, AlertStatus, Response, SubmissionOutcome};

/// Where an event is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Alert(Uuid),
    User(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Alert(id) => write!(f, "alert:{id}"),
            Topic::User(id) => write!(f, "user:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("alert", id)) => Uuid::parse_str(id)
                .map(Topic::Alert)
                .map_err(|_| DispatchError::Validation(format!("bad alert id in topic '{s}'"))),
            Some(("user", id)) if !id.is_empty() => Ok(Topic::User(id.to_string())),
            _ => Err(DispatchError::Validation(format!(
                "topic must be alert:{{id}} or user:{{id}}, got '{s}'"
            ))),
        }
    }
}

/// How the matching step of a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Completed,
    /// The query timed out; matching continues in the background.
    Retrying,
    /// Every background attempt timed out or failed.
    Exhausted,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationKind {
    /// Sent to each matched responder.
    AlertRaised { alert: Alert, distance_m: f64 },
    /// How many responders were notified; zero means nobody is eligible.
    DispatchSummary {
        notified_count: usize,
        matching: MatchStatus,
    },
    StatusChanged {
        from: AlertStatus,
        to: AlertStatus,
        alert: Alert,
    },
    ResponseRecorded {
        response: Response,
        outcome: SubmissionOutcome,
    },
    ResponseUpdated { response: Response },
}

/// One event on one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event_id: Uuid,
    pub topic: String,
    pub alert_id: Uuid,
    /// Version of the alert when the event was emitted.
    pub alert_version: i64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(topic: &Topic, alert: &Alert, kind: NotificationKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic: topic.to_string(),
            alert_id: alert.id,
            alert_version: alert.version,
            emitted_at: Utc::now(),
            kind,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self.kind {
            NotificationKind::AlertRaised { .. } => "alert_raised",
            NotificationKind::DispatchSummary { .. } => "dispatch_summary",
            NotificationKind::StatusChanged { .. } => "status_changed",
            NotificationKind::ResponseRecorded { .. } => "response_recorded",
            NotificationKind::ResponseUpdated { .. } => "response_updated",
        }
    }
}

/// Why a snapshot was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    Connected,
    /// The subscriber fell behind and `skipped` events were dropped.
    Lagged,
}

/// Snapshot of the alerts a topic covers.
///
/// For `alert:{id}` that is the alert itself; for `user:{id}` it is every
/// active alert the user raised or was notified about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename = "resync")]
pub struct Resync {
    pub topic: String,
    pub reason: ResyncReason,
    pub skipped: u64,
    pub alerts: Vec<Alert>,
    pub taken_at: DateTime<Utc>,
}

impl Resync {
    pub fn new(topic: &Topic, reason: ResyncReason, skipped: u64, alerts: Vec<Alert>) -> Self {
        Self {
            topic: topic.to_string(),
            reason,
            skipped,
            alerts,
            taken_at: Utc::now(),
        }
    }
}

/// One frame on a subscriber's stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Resync(Resync),
    Event(Notification),
}

/// Default buffer capacity per topic.
const DEFAULT_CAPACITY: usize = 256;

/// Topic-keyed fan-out hub.
pub struct NotificationChannel {
    topics: Mutex<HashMap<Topic, broadcast::Sender<Notification>>>,
    capacity: usize,
}

impl NotificationChannel {
    /// Create a hub whose topics buffer `capacity` events each.
    ///
    /// A subscriber that falls further behind observes `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to every future event on `topic`.
    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<Notification> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish `kind` about `alert` on `topic`.
    ///
    /// Returns the number of subscribers that received it. A topic nobody
    /// listens to is dropped.
    pub fn publish(&self, topic: &Topic, alert: &Alert, kind: NotificationKind) -> usize {
        self.send(topic, Notification::new(topic, alert, kind))
    }

    /// Publish an already built notification.
    pub fn send(&self, topic: &Topic, notification: Notification) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = topics.get(topic) else {
            return 0;
        };

        let event = notification.event_name();
        match sender.send(notification) {
            Ok(delivered) => {
                trace!(topic = %topic, event, delivered, "Notification published");
                delivered
            }
            Err(_) => {
                topics.remove(topic);
                0
            }
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map_or(0, |s| s.receiver_count())
    }

    /// Number of topics currently held open.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every topic that has no receivers left.
    pub fn prune(&self) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertSpec, LocationInput};

    fn alert() -> Alert {
        AlertSpec {
            requester_id: Some("victim-1".into()),
            emergency_type: Some("medical".into()),
            location: Some(LocationInput {
                latitude: Some(1.0),
                longitude: Some(2.0),
                address: None,
            }),
            ..Default::default()
        }
        .into_alert(1000, Utc::now())
        .unwrap()
    }

    #[test]
    fn test_topic_parse_and_display() {
        let id = Uuid::new_v4();
        let topic: Topic = format!("alert:{id}").parse().unwrap();
        assert_eq!(topic, Topic::Alert(id));
        assert_eq!(topic.to_string(), format!("alert:{id}"));

        let user: Topic = "user:r-7".parse().unwrap();
        assert_eq!(user, Topic::User("r-7".into()));

        assert!("alert:not-a-uuid".parse::<Topic>().is_err());
        assert!("user:".parse::<Topic>().is_err());
        assert!("room:1".parse::<Topic>().is_err());
    }

    #[tokio::test]
    async fn test_publish_reaches_only_topic_subscribers() {
        let channel = NotificationChannel::default();
        let alert = alert();
        let alert_topic = Topic::Alert(alert.id);
        let other_topic = Topic::User("someone-else".into());

        let mut rx = channel.subscribe(&alert_topic);
        let mut other = channel.subscribe(&other_topic);

        let delivered = channel.publish(
            &alert_topic,
            &alert,
            NotificationKind::DispatchSummary {
                notified_count: 3,
                matching: MatchStatus::Completed,
            },
        );
        assert_eq!(delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.alert_id, alert.id);
        assert_eq!(received.topic, alert_topic.to_string());
        assert!(matches!(
            received.kind,
            NotificationKind::DispatchSummary {
                notified_count: 3,
                ..
            }
        ));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let channel = NotificationChannel::default();
        let alert = alert();
        let topic = Topic::Alert(alert.id);
        let mut rx = channel.subscribe(&topic);

        for count in 0..5 {
            channel.publish(
                &topic,
                &alert,
                NotificationKind::DispatchSummary {
                    notified_count: count,
                    matching: MatchStatus::Completed,
                },
            );
        }

        for expected in 0..5 {
            match rx.recv().await.unwrap().kind {
                NotificationKind::DispatchSummary { notified_count, .. } => {
                    assert_eq!(notified_count, expected)
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_does_not_create_topic() {
        let channel = NotificationChannel::default();
        let alert = alert();
        let delivered = channel.publish(
            &Topic::Alert(alert.id),
            &alert,
            NotificationKind::DispatchSummary {
                notified_count: 0,
                matching: MatchStatus::Completed,
            },
        );
        assert_eq!(delivered, 0);
        assert_eq!(channel.topic_count(), 0);
    }

    #[test]
    fn test_abandoned_topics_are_dropped() {
        let channel = NotificationChannel::default();
        let alert = alert();
        let topic = Topic::Alert(alert.id);

        let rx = channel.subscribe(&topic);
        assert_eq!(channel.subscriber_count(&topic), 1);
        drop(rx);

        channel.publish(
            &topic,
            &alert,
            NotificationKind::DispatchSummary {
                notified_count: 0,
                matching: MatchStatus::Completed,
            },
        );
        assert_eq!(channel.topic_count(), 0);

        let _rx = channel.subscribe(&Topic::User("a".into()));
        drop(channel.subscribe(&Topic::User("b".into())));
        channel.prune();
        assert_eq!(channel.topic_count(), 1);
    }

    #[test]
    fn test_resync_frame_serializes_event_tag() {
        let alert = alert();
        let frame = Frame::Resync(Resync::new(
            &Topic::User("victim-1".into()),
            ResyncReason::Lagged,
            4,
            vec![alert.clone()],
        ));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "resync");
        assert_eq!(json["topic"], "user:victim-1");
        assert_eq!(json["reason"], "lagged");
        assert_eq!(json["skipped"], 4);
        assert_eq!(json["alerts"][0]["id"], alert.id.to_string());
        assert_eq!(json["alerts"][0]["version"], 1);
    }

    #[tokio::test]
    async fn test_slow_receiver_observes_lag() {
        let channel = NotificationChannel::new(1);
        let alert = alert();
        let topic = Topic::Alert(alert.id);
        let mut rx = channel.subscribe(&topic);

        for count in 0..3 {
            channel.publish(
                &topic,
                &alert,
                NotificationKind::DispatchSummary {
                    notified_count: count,
                    matching: MatchStatus::Completed,
                },
            );
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }

    #[test]
    fn test_notification_serializes_event_tag() {
        let alert = alert();
        let n = Notification::new(
            &Topic::Alert(alert.id),
            &alert,
            NotificationKind::DispatchSummary {
                notified_count: 2,
                matching: MatchStatus::Retrying,
            },
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["event"], "dispatch_summary");
        assert_eq!(json["matching"], "retrying");
        assert_eq!(json["alert_version"], 1);
    }
}
