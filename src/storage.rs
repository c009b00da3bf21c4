//! SQLite storage layer for Lifeline.
//!
//! Every mutation that the lifecycle depends on is a single conditional
//! statement, so the store itself decides races:
//!
//! - status changes are `UPDATE … WHERE id = ? AND status = ?` (CAS)
//! - response writes only land while the owning alert is non-terminal
//! - the single-active-alert policy is checked inside the insert
//!
//! No read-modify-write transaction spans more than one statement.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::model::{
    Alert, AlertState, AlertStatus, Candidate, EmergencyType, GeoPoint, Location,
    ResponderAvailability, ResponderStats, Response, ResponseDecision, StateColumns,
};

/// Separator used when notified responder ids are concatenated in SQL.
const ID_SEPARATOR: char = '\u{1f}';

const ALERT_SELECT: &str = r#"
    SELECT a.*,
        (SELECT GROUP_CONCAT(n.responder_id, char(31))
         FROM alert_notifications n
         WHERE n.alert_id = a.id) AS notified
    FROM alerts a
"#;

/// Axis-aligned search window for radius queries, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:lifeline.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL,
                emergency_type TEXT NOT NULL,
                urgency TEXT NOT NULL,
                title TEXT,
                description TEXT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                address TEXT,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                acknowledged_at INTEGER,
                started_at INTEGER,
                resolved_at INTEGER,
                cancelled_by TEXT,
                version INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_requester_status
            ON alerts(requester_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_status_created
            ON alerts(status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                id TEXT PRIMARY KEY,
                alert_id TEXT NOT NULL REFERENCES alerts(id),
                responder_id TEXT NOT NULL,
                submitted_at INTEGER NOT NULL,
                decision TEXT NOT NULL,
                estimated_arrival_minutes INTEGER,
                message TEXT,
                arrived_at INTEGER,
                completed_at INTEGER,
                rating INTEGER,
                feedback TEXT,
                UNIQUE (alert_id, responder_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_responses_responder
            ON responses(responder_id, submitted_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_notifications (
                alert_id TEXT NOT NULL REFERENCES alerts(id),
                responder_id TEXT NOT NULL,
                distance_m REAL NOT NULL,
                notified_at INTEGER NOT NULL,
                PRIMARY KEY (alert_id, responder_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS responder_availability (
                responder_id TEXT PRIMARY KEY,
                is_available INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                capabilities TEXT NOT NULL,
                notification_radius_m REAL NOT NULL,
                last_updated INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for radius prefiltering
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_availability_position
            ON responder_availability(is_available, latitude, longitude)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------------

    /// Insert a new pending alert.
    ///
    /// With `single_active` set the insert only happens if the requester has
    /// no non-terminal alert; returns `false` when it was skipped.
    pub async fn insert_alert(&self, alert: &Alert, single_active: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (
                id, requester_id, emergency_type, urgency, title, description,
                latitude, longitude, address, created_at, status, version
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?
            WHERE NOT (? AND EXISTS (
                SELECT 1 FROM alerts
                WHERE requester_id = ?
                  AND status IN ('pending', 'acknowledged', 'in_progress')
            ))
            "#,
        )
        .bind(alert.id.to_string())
        .bind(&alert.requester_id)
        .bind(alert.emergency_type.as_str())
        .bind(alert.urgency.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(alert.location.latitude)
        .bind(alert.location.longitude)
        .bind(&alert.location.address)
        .bind(alert.created_at.timestamp_millis())
        .bind(alert.version)
        .bind(single_active)
        .bind(&alert.requester_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>, sqlx::Error> {
        let sql = format!("{ALERT_SELECT} WHERE a.id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    /// Atomically move an alert from `expected` to `next`.
    ///
    /// Returns `true` only for the single caller whose write landed; every
    /// other caller observing the same `expected` gets `false`.
    pub async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: AlertStatus,
        next: &AlertState,
    ) -> Result<bool, sqlx::Error> {
        let StateColumns {
            acknowledged_at,
            started_at,
            resolved_at,
            cancelled_by,
        } = next.columns();

        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = ?,
                acknowledged_at = ?,
                started_at = ?,
                resolved_at = ?,
                cancelled_by = ?,
                version = version + 1
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.status().as_str())
        .bind(acknowledged_at.map(|t| t.timestamp_millis()))
        .bind(started_at.map(|t| t.timestamp_millis()))
        .bind(resolved_at.map(|t| t.timestamp_millis()))
        .bind(cancelled_by)
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Alerts raised by one requester, newest first.
    pub async fn list_requester_alerts(
        &self,
        requester_id: &str,
        status: Option<AlertStatus>,
        limit: u32,
    ) -> Result<Vec<Alert>, sqlx::Error> {
        let sql = format!(
            "{ALERT_SELECT} WHERE a.requester_id = ? AND (? IS NULL OR a.status = ?) \
             ORDER BY a.created_at DESC LIMIT ?"
        );
        let status = status.map(AlertStatus::as_str);
        let rows = sqlx::query(&sql)
            .bind(requester_id)
            .bind(status)
            .bind(status)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    /// Non-terminal alerts, newest first.
    pub async fn list_active_alerts(&self, limit: u32) -> Result<Vec<Alert>, sqlx::Error> {
        let sql = format!(
            "{ALERT_SELECT} WHERE a.status IN ('pending', 'acknowledged', 'in_progress') \
             ORDER BY a.created_at DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    /// Non-terminal alerts a user raised or was notified about, newest first.
    pub async fn list_user_active_alerts(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<Alert>, sqlx::Error> {
        let sql = format!(
            "{ALERT_SELECT} WHERE a.status IN ('pending', 'acknowledged', 'in_progress') \
             AND (a.requester_id = ? OR EXISTS ( \
                 SELECT 1 FROM alert_notifications m \
                 WHERE m.alert_id = a.id AND m.responder_id = ?)) \
             ORDER BY a.created_at DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(user_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    /// Ids and creation times of every alert still pending.
    pub async fn list_pending_alerts(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at FROM alerts
            WHERE status = 'pending'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_, sqlx::Error> {
                let id = parse_uuid(row.try_get("id")?)?;
                let created_at = from_millis(row.try_get("created_at")?)?;
                Ok((id, created_at))
            })
            .collect()
    }

    /// Add a responder to the notified set of an alert. Repeats are ignored.
    pub async fn record_notification(
        &self,
        alert_id: Uuid,
        candidate: &Candidate,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO alert_notifications (alert_id, responder_id, distance_m, notified_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(alert_id.to_string())
        .bind(&candidate.responder_id)
        .bind(candidate.distance_m)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------------

    /// Record a response, overwriting the responder's earlier one for the
    /// same alert.
    ///
    /// Nothing is written unless the alert exists and is non-terminal; in
    /// that case `None` is returned.
    pub async fn upsert_response(&self, response: &Response) -> Result<Option<Response>, sqlx::Error> {
        let eta = match &response.decision {
            ResponseDecision::Accepted {
                estimated_arrival_minutes,
                ..
            } => estimated_arrival_minutes.map(i64::from),
            ResponseDecision::Declined => None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO responses (
                id, alert_id, responder_id, submitted_at, decision,
                estimated_arrival_minutes, message
            )
            SELECT ?, ?, ?, ?, ?, ?, ?
            FROM alerts
            WHERE alerts.id = ?
              AND alerts.status IN ('pending', 'acknowledged', 'in_progress')
            ON CONFLICT (alert_id, responder_id) DO UPDATE SET
                submitted_at = excluded.submitted_at,
                decision = excluded.decision,
                estimated_arrival_minutes = excluded.estimated_arrival_minutes,
                message = excluded.message,
                arrived_at = CASE WHEN excluded.decision = 'accepted' THEN arrived_at END,
                completed_at = CASE WHEN excluded.decision = 'accepted' THEN completed_at END,
                rating = CASE WHEN excluded.decision = 'accepted' THEN rating END,
                feedback = CASE WHEN excluded.decision = 'accepted' THEN feedback END
            "#,
        )
        .bind(response.id.to_string())
        .bind(response.alert_id.to_string())
        .bind(&response.responder_id)
        .bind(response.submitted_at.timestamp_millis())
        .bind(response.decision.decision().as_str())
        .bind(eta)
        .bind(&response.message)
        .bind(response.alert_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_response(response.alert_id, &response.responder_id)
            .await
    }

    pub async fn get_response(
        &self,
        alert_id: Uuid,
        responder_id: &str,
    ) -> Result<Option<Response>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT * FROM responses
            WHERE alert_id = ? AND responder_id = ?
            "#,
        )
        .bind(alert_id.to_string())
        .bind(responder_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(response_from_row).transpose()
    }

    /// Every response to an alert, in submission order.
    pub async fn list_responses(&self, alert_id: Uuid) -> Result<Vec<Response>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM responses
            WHERE alert_id = ?
            ORDER BY submitted_at, responder_id
            "#,
        )
        .bind(alert_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(response_from_row).collect()
    }

    /// A responder's own responses, newest first.
    pub async fn list_responder_responses(
        &self,
        responder_id: &str,
        limit: u32,
    ) -> Result<Vec<Response>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM responses
            WHERE responder_id = ?
            ORDER BY submitted_at DESC
            LIMIT ?
            "#,
        )
        .bind(responder_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(response_from_row).collect()
    }

    /// Stamp `arrived_at` on an accepted response of an active alert.
    ///
    /// Returns `false` if the response is missing, declined, already past
    /// this step, or the alert is terminal.
    pub async fn mark_arrived(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE responses SET arrived_at = ?
            WHERE alert_id = ? AND responder_id = ?
              AND decision = 'accepted'
              AND arrived_at IS NULL
              AND completed_at IS NULL
              AND EXISTS (
                  SELECT 1 FROM alerts
                  WHERE alerts.id = responses.alert_id
                    AND alerts.status IN ('pending', 'acknowledged', 'in_progress')
              )
            "#,
        )
        .bind(at.timestamp_millis())
        .bind(alert_id.to_string())
        .bind(responder_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stamp `completed_at` on an accepted response of an active alert.
    pub async fn mark_completed(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE responses SET completed_at = ?
            WHERE alert_id = ? AND responder_id = ?
              AND decision = 'accepted'
              AND completed_at IS NULL
              AND EXISTS (
                  SELECT 1 FROM alerts
                  WHERE alerts.id = responses.alert_id
                    AND alerts.status IN ('pending', 'acknowledged', 'in_progress')
              )
            "#,
        )
        .bind(at.timestamp_millis())
        .bind(alert_id.to_string())
        .bind(responder_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Set the rating of a completed response, once.
    pub async fn set_rating(
        &self,
        alert_id: Uuid,
        responder_id: &str,
        rating: u8,
        feedback: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE responses SET rating = ?, feedback = ?
            WHERE alert_id = ? AND responder_id = ?
              AND completed_at IS NOT NULL
              AND rating IS NULL
            "#,
        )
        .bind(i64::from(rating))
        .bind(feedback)
        .bind(alert_id.to_string())
        .bind(responder_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn responder_stats(&self, responder_id: &str) -> Result<ResponderStats, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN r.decision = 'accepted' THEN 1 ELSE 0 END), 0) AS accepted,
                COALESCE(SUM(CASE WHEN r.completed_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS completed,
                AVG(CASE WHEN r.decision = 'accepted'
                    THEN (r.submitted_at - a.created_at) / 1000.0 END) AS avg_response_secs,
                AVG(r.rating * 1.0) AS avg_rating
            FROM responses r
            JOIN alerts a ON a.id = r.alert_id
            WHERE r.responder_id = ?
            "#,
        )
        .bind(responder_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ResponderStats {
            responder_id: responder_id.to_string(),
            total_responses: row.try_get("total")?,
            accepted_responses: row.try_get("accepted")?,
            completed_responses: row.try_get("completed")?,
            average_response_secs: row.try_get("avg_response_secs")?,
            average_rating: row.try_get("avg_rating")?,
        })
    }

    // ------------------------------------------------------------------------
    // Responder availability
    // ------------------------------------------------------------------------

    pub async fn upsert_availability(
        &self,
        availability: &ResponderAvailability,
    ) -> Result<(), sqlx::Error> {
        let capabilities = availability
            .capabilities
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            INSERT INTO responder_availability (
                responder_id, is_available, latitude, longitude,
                capabilities, notification_radius_m, last_updated
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (responder_id) DO UPDATE SET
                is_available = excluded.is_available,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                capabilities = excluded.capabilities,
                notification_radius_m = excluded.notification_radius_m,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&availability.responder_id)
        .bind(availability.is_available)
        .bind(availability.location.latitude)
        .bind(availability.location.longitude)
        .bind(capabilities)
        .bind(availability.notification_radius_m)
        .bind(availability.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_availability(
        &self,
        responder_id: &str,
    ) -> Result<Option<ResponderAvailability>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT * FROM responder_availability
            WHERE responder_id = ?
            "#,
        )
        .bind(responder_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(availability_from_row).transpose()
    }

    /// Available responders whose position falls inside `bounds`.
    pub async fn available_responders_within(
        &self,
        bounds: BoundingBox,
    ) -> Result<Vec<ResponderAvailability>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM responder_availability
            WHERE is_available = 1
              AND latitude BETWEEN ? AND ?
              AND longitude BETWEEN ? AND ?
            "#,
        )
        .bind(bounds.min_latitude)
        .bind(bounds.max_latitude)
        .bind(bounds.min_longitude)
        .bind(bounds.max_longitude)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(availability_from_row).collect()
    }
}

// ----------------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------------

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| decode_error(format!("bad timestamp {ms}")))
}

fn opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    ms.map(from_millis).transpose()
}

fn parse_uuid(raw: String) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(&raw).map_err(|e| decode_error(format!("bad id {raw}: {e}")))
}

fn parse_column<T>(raw: String) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| decode_error(format!("bad value {raw}: {e}")))
}

fn alert_from_row(row: &SqliteRow) -> Result<Alert, sqlx::Error> {
    let id = parse_uuid(row.try_get("id")?)?;
    let status: AlertStatus = parse_column(row.try_get("status")?)?;
    let columns = StateColumns {
        acknowledged_at: opt_millis(row.try_get("acknowledged_at")?)?,
        started_at: opt_millis(row.try_get("started_at")?)?,
        resolved_at: opt_millis(row.try_get("resolved_at")?)?,
        cancelled_by: row.try_get("cancelled_by")?,
    };
    let state = AlertState::from_columns(status, columns)
        .ok_or_else(|| decode_error(format!("alert {id} has inconsistent {status} columns")))?;

    let notified: Option<String> = row.try_get("notified")?;
    let notified_responder_ids: BTreeSet<String> = notified
        .map(|joined| {
            joined
                .split(ID_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Alert {
        id,
        requester_id: row.try_get("requester_id")?,
        emergency_type: parse_column(row.try_get("emergency_type")?)?,
        urgency: parse_column(row.try_get("urgency")?)?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        location: Location {
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            address: row.try_get("address")?,
        },
        created_at: from_millis(row.try_get("created_at")?)?,
        state,
        version: row.try_get("version")?,
        notified_responder_ids,
    })
}

fn response_from_row(row: &SqliteRow) -> Result<Response, sqlx::Error> {
    let decision: String = row.try_get("decision")?;
    let decision = match decision.as_str() {
        "declined" => ResponseDecision::Declined,
        "accepted" => {
            let eta: Option<i64> = row.try_get("estimated_arrival_minutes")?;
            let rating: Option<i64> = row.try_get("rating")?;
            ResponseDecision::Accepted {
                estimated_arrival_minutes: eta
                    .map(u32::try_from)
                    .transpose()
                    .map_err(|e| decode_error(format!("bad eta: {e}")))?,
                arrived_at: opt_millis(row.try_get("arrived_at")?)?,
                completed_at: opt_millis(row.try_get("completed_at")?)?,
                rating: rating
                    .map(u8::try_from)
                    .transpose()
                    .map_err(|e| decode_error(format!("bad rating: {e}")))?,
                feedback: row.try_get("feedback")?,
            }
        }
        other => return Err(decode_error(format!("bad decision {other}"))),
    };

    Ok(Response {
        id: parse_uuid(row.try_get("id")?)?,
        alert_id: parse_uuid(row.try_get("alert_id")?)?,
        responder_id: row.try_get("responder_id")?,
        submitted_at: from_millis(row.try_get("submitted_at")?)?,
        message: row.try_get("message")?,
        decision,
    })
}

fn availability_from_row(row: &SqliteRow) -> Result<ResponderAvailability, sqlx::Error> {
    let capabilities: String = row.try_get("capabilities")?;
    let capabilities = capabilities
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_column::<EmergencyType>(s.to_string()))
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(ResponderAvailability {
        responder_id: row.try_get("responder_id")?,
        is_available: row.try_get("is_available")?,
        location: GeoPoint {
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
        },
        capabilities,
        notification_radius_m: row.try_get("notification_radius_m")?,
        last_updated: from_millis(row.try_get("last_updated")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertSpec, Decision, LocationInput, ResponseSubmission};

    async fn setup() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    fn alert(requester: &str) -> Alert {
        AlertSpec {
            requester_id: Some(requester.to_string()),
            emergency_type: Some("fire".into()),
            location: Some(LocationInput {
                latitude: Some(51.5),
                longitude: Some(-0.12),
                address: None,
            }),
            ..Default::default()
        }
        .into_alert(1000, Utc::now())
        .unwrap()
    }

    fn accept(alert_id: Uuid, responder: &str) -> Response {
        ResponseSubmission {
            responder_id: responder.to_string(),
            decision: Decision::Accepted,
            estimated_arrival_minutes: Some(4),
            message: None,
        }
        .into_response(alert_id, Utc::now())
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_alert() {
        let storage = setup().await;
        let a = alert("victim-1");

        assert!(storage.insert_alert(&a, true).await.unwrap());

        let loaded = storage.get_alert(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, a.id);
        assert_eq!(loaded.status(), AlertStatus::Pending);
        assert!(loaded.notified_responder_ids.is_empty());
        assert!(storage.get_alert(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_active_alert_is_enforced_in_insert() {
        let storage = setup().await;

        assert!(storage.insert_alert(&alert("victim-1"), true).await.unwrap());
        assert!(!storage.insert_alert(&alert("victim-1"), true).await.unwrap());
        // Policy off: allowed.
        assert!(storage.insert_alert(&alert("victim-1"), false).await.unwrap());
        // Other requesters are unaffected.
        assert!(storage.insert_alert(&alert("victim-2"), true).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_set_only_matches_expected() {
        let storage = setup().await;
        let a = alert("victim-1");
        storage.insert_alert(&a, true).await.unwrap();

        let acked = a
            .state
            .advance(AlertStatus::Acknowledged, Utc::now(), None)
            .unwrap();
        assert!(storage
            .compare_and_set_status(a.id, AlertStatus::Pending, &acked)
            .await
            .unwrap());
        // Second writer with the same expectation loses.
        assert!(!storage
            .compare_and_set_status(a.id, AlertStatus::Pending, &acked)
            .await
            .unwrap());

        let loaded = storage.get_alert(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), AlertStatus::Acknowledged);
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_upsert_response_overwrites() {
        let storage = setup().await;
        let a = alert("victim-1");
        storage.insert_alert(&a, true).await.unwrap();

        let first = storage
            .upsert_response(&accept(a.id, "r-1"))
            .await
            .unwrap()
            .unwrap();
        let second = storage
            .upsert_response(&accept(a.id, "r-1"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(storage.list_responses(a.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_response_refused_on_terminal_alert() {
        let storage = setup().await;
        let a = alert("victim-1");
        storage.insert_alert(&a, true).await.unwrap();

        let expired = a
            .state
            .advance(AlertStatus::Expired, Utc::now(), None)
            .unwrap();
        storage
            .compare_and_set_status(a.id, AlertStatus::Pending, &expired)
            .await
            .unwrap();

        assert!(storage
            .upsert_response(&accept(a.id, "r-1"))
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .upsert_response(&accept(Uuid::new_v4(), "r-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rating_requires_completion_and_is_set_once() {
        let storage = setup().await;
        let a = alert("victim-1");
        storage.insert_alert(&a, true).await.unwrap();
        storage.upsert_response(&accept(a.id, "r-1")).await.unwrap();

        assert!(!storage.set_rating(a.id, "r-1", 5, None).await.unwrap());

        assert!(storage.mark_completed(a.id, "r-1", Utc::now()).await.unwrap());
        assert!(storage
            .set_rating(a.id, "r-1", 5, Some("thank you"))
            .await
            .unwrap());
        assert!(!storage.set_rating(a.id, "r-1", 1, None).await.unwrap());

        let response = storage.get_response(a.id, "r-1").await.unwrap().unwrap();
        assert_eq!(response.rating(), Some(5));
    }

    #[tokio::test]
    async fn test_notified_set_is_loaded_with_alert() {
        let storage = setup().await;
        let a = alert("victim-1");
        storage.insert_alert(&a, true).await.unwrap();

        for id in ["r-1", "r-2", "r-1"] {
            let candidate = Candidate {
                responder_id: id.to_string(),
                distance_m: 100.0,
                last_updated: Utc::now(),
            };
            storage
                .record_notification(a.id, &candidate, Utc::now())
                .await
                .unwrap();
        }

        let loaded = storage.get_alert(a.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.notified_responder_ids.into_iter().collect::<Vec<_>>(),
            vec!["r-1".to_string(), "r-2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_user_active_alerts_cover_requested_and_notified() {
        let storage = setup().await;
        let raised = alert("victim-1");
        let other = alert("victim-2");
        storage.insert_alert(&raised, true).await.unwrap();
        storage.insert_alert(&other, true).await.unwrap();
        let candidate = Candidate {
            responder_id: "victim-1".to_string(),
            distance_m: 300.0,
            last_updated: Utc::now(),
        };
        storage
            .record_notification(other.id, &candidate, Utc::now())
            .await
            .unwrap();

        let active = storage
            .list_user_active_alerts("victim-1", 10)
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(storage
            .list_user_active_alerts("nobody", 10)
            .await
            .unwrap()
            .is_empty());

        let cancelled = raised
            .state
            .advance(AlertStatus::Cancelled, Utc::now(), Some("victim-1"))
            .unwrap();
        assert!(storage
            .compare_and_set_status(raised.id, AlertStatus::Pending, &cancelled)
            .await
            .unwrap());

        let active = storage
            .list_user_active_alerts("victim-1", 10)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, other.id);
    }

    #[tokio::test]
    async fn test_availability_roundtrip_and_box_filter() {
        let storage = setup().await;
        let availability = ResponderAvailability {
            responder_id: "r-1".into(),
            is_available: true,
            location: GeoPoint {
                latitude: 51.5,
                longitude: -0.12,
            },
            capabilities: [EmergencyType::Fire, EmergencyType::Medical].into_iter().collect(),
            notification_radius_m: 2000.0,
            last_updated: Utc::now(),
        };
        storage.upsert_availability(&availability).await.unwrap();

        let loaded = storage.get_availability("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.capabilities, availability.capabilities);

        let inside = BoundingBox {
            min_latitude: 51.0,
            max_latitude: 52.0,
            min_longitude: -1.0,
            max_longitude: 1.0,
        };
        let outside = BoundingBox {
            min_latitude: 40.0,
            max_latitude: 41.0,
            ..inside
        };
        assert_eq!(storage.available_responders_within(inside).await.unwrap().len(), 1);
        assert!(storage.available_responders_within(outside).await.unwrap().is_empty());
    }
}
