//! Eligible-responder matching.
//!
//! The matcher holds no state of its own. It asks the store for available
//! responders inside a bounding box sized by the largest allowed radius, then
//! applies the exact filters in memory:
//!
//! 1. `is_available` is set
//! 2. the responder lists the alert's emergency type as a capability
//! 3. the haversine distance is within the responder's own radius
//!
//! Results are ordered by ascending distance; ties go to the fresher location.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::model::{Alert, Candidate, EmergencyType, GeoPoint, ResponderAvailability};
use crate::storage::{BoundingBox, Storage};

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Smallest lat/lng box containing every point within `radius_m` of `center`.
///
/// Near the poles or the antimeridian the longitude range widens to the full
/// circle instead of wrapping.
pub fn bounding_box(center: GeoPoint, radius_m: f64) -> BoundingBox {
    let dlat = (radius_m / EARTH_RADIUS_M).to_degrees();
    let min_latitude = (center.latitude - dlat).max(-90.0);
    let max_latitude = (center.latitude + dlat).min(90.0);

    let cos_lat = center.latitude.to_radians().cos();
    let full_circle = min_latitude <= -90.0 || max_latitude >= 90.0 || cos_lat <= f64::EPSILON;
    let dlng = if full_circle { 180.0 } else { dlat / cos_lat };

    let (min_longitude, max_longitude) =
        if full_circle || center.longitude - dlng < -180.0 || center.longitude + dlng > 180.0 {
            (-180.0, 180.0)
        } else {
            (center.longitude - dlng, center.longitude + dlng)
        };

    BoundingBox {
        min_latitude,
        max_latitude,
        min_longitude,
        max_longitude,
    }
}

/// Apply the eligibility filters and ordering to a set of responders.
///
/// `exclude` is the requester, who never gets notified about their own alert.
/// Each responder's radius is capped at `max_radius_m`.
pub fn rank_candidates(
    origin: GeoPoint,
    emergency_type: EmergencyType,
    exclude: &str,
    max_radius_m: f64,
    responders: impl IntoIterator<Item = ResponderAvailability>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = responders
        .into_iter()
        .filter(|r| r.is_available)
        .filter(|r| r.responder_id != exclude)
        .filter(|r| r.capabilities.contains(&emergency_type))
        .filter_map(|r| {
            let distance_m = haversine_m(origin, r.location);
            let radius = r.notification_radius_m.min(max_radius_m);
            (distance_m <= radius).then(|| Candidate {
                responder_id: r.responder_id,
                distance_m,
                last_updated: r.last_updated,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance_m
            .total_cmp(&b.distance_m)
            .then_with(|| b.last_updated.cmp(&a.last_updated))
            .then_with(|| a.responder_id.cmp(&b.responder_id))
    });

    candidates
}

/// Finds the responders an alert should be fanned out to.
#[derive(Clone)]
pub struct GeoMatcher {
    storage: Storage,
    max_radius_m: f64,
    timeout: Duration,
}

impl GeoMatcher {
    pub fn new(storage: Storage, max_radius_m: f64, timeout: Duration) -> Self {
        Self {
            storage,
            max_radius_m,
            timeout,
        }
    }

    /// Ordered eligible responders for `alert`.
    ///
    /// An empty list is a normal answer. The query is bounded by the
    /// configured timeout and reports [`DispatchError::DependencyTimeout`]
    /// when it is exceeded.
    pub async fn find_eligible_responders(
        &self,
        alert: &Alert,
    ) -> Result<Vec<Candidate>, DispatchError> {
        match tokio::time::timeout(self.timeout, self.query(alert)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    alert_id = %alert.id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Eligible responder query timed out"
                );
                Err(DispatchError::DependencyTimeout("geo matcher"))
            }
        }
    }

    async fn query(&self, alert: &Alert) -> Result<Vec<Candidate>, DispatchError> {
        let origin = alert.location.point();
        let bounds = bounding_box(origin, self.max_radius_m);
        let responders = self.storage.available_responders_within(bounds).await?;
        let scanned = responders.len();

        let candidates = rank_candidates(
            origin,
            alert.emergency_type,
            &alert.requester_id,
            self.max_radius_m,
            responders,
        );

        debug!(
            alert_id = %alert.id,
            scanned,
            eligible = candidates.len(),
            "Eligible responders computed"
        );

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;

    const NYC: GeoPoint = GeoPoint {
        latitude: 40.7128,
        longitude: -74.0060,
    };

    /// A point `meters` due north of `origin`.
    fn north_of(origin: GeoPoint, meters: f64) -> GeoPoint {
        GeoPoint {
            latitude: origin.latitude + (meters / EARTH_RADIUS_M).to_degrees(),
            longitude: origin.longitude,
        }
    }

    fn responder(id: &str, at: GeoPoint, radius: f64) -> ResponderAvailability {
        ResponderAvailability {
            responder_id: id.to_string(),
            is_available: true,
            location: at,
            capabilities: [EmergencyType::Medical].into_iter().collect(),
            notification_radius_m: radius,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // New York to Los Angeles is roughly 3936 km.
        let la = GeoPoint {
            latitude: 34.0522,
            longitude: -118.2437,
        };
        let d = haversine_m(NYC, la);
        assert!((d - 3_936_000.0).abs() < 10_000.0, "got {d}");
        assert_eq!(haversine_m(NYC, NYC), 0.0);
    }

    #[test]
    fn test_north_offset_matches_haversine() {
        let p = north_of(NYC, 450.0);
        assert!((haversine_m(NYC, p) - 450.0).abs() < 0.01);
    }

    #[test]
    fn test_bounding_box_contains_radius() {
        let b = bounding_box(NYC, 1000.0);
        let p = north_of(NYC, 999.0);
        assert!(p.latitude <= b.max_latitude);
        assert!(b.min_longitude < NYC.longitude && NYC.longitude < b.max_longitude);
    }

    #[test]
    fn test_bounding_box_near_antimeridian_is_full_width() {
        let b = bounding_box(
            GeoPoint {
                latitude: 0.0,
                longitude: 179.99,
            },
            5000.0,
        );
        assert_eq!((b.min_longitude, b.max_longitude), (-180.0, 180.0));
    }

    #[test]
    fn test_rank_orders_by_distance() {
        let responders = vec![
            responder("far", north_of(NYC, 1450.0), 5000.0),
            responder("near", north_of(NYC, 450.0), 5000.0),
            responder("mid", north_of(NYC, 920.0), 5000.0),
        ];

        let ranked = rank_candidates(NYC, EmergencyType::Medical, "victim", 10_000.0, responders);

        let ids: Vec<_> = ranked.iter().map(|c| c.responder_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
    }

    #[test]
    fn test_rank_breaks_ties_by_freshness() {
        let at = north_of(NYC, 300.0);
        let mut stale = responder("stale", at, 5000.0);
        stale.last_updated = Utc::now() - ChronoDuration::minutes(10);
        let fresh = responder("fresh", at, 5000.0);

        let ranked = rank_candidates(NYC, EmergencyType::Medical, "victim", 10_000.0, vec![stale, fresh]);

        assert_eq!(ranked[0].responder_id, "fresh");
        assert_eq!(ranked[1].responder_id, "stale");
    }

    #[test]
    fn test_rank_uses_each_responders_own_radius() {
        let responders = vec![
            // 800 m away but only wants alerts within 500 m.
            responder("picky", north_of(NYC, 800.0), 500.0),
            responder("wide", north_of(NYC, 800.0), 1000.0),
        ];

        let ranked = rank_candidates(NYC, EmergencyType::Medical, "victim", 10_000.0, responders);

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].responder_id, "wide");
    }

    #[test]
    fn test_rank_filters_availability_capability_and_requester() {
        let mut off_duty = responder("off-duty", north_of(NYC, 100.0), 5000.0);
        off_duty.is_available = false;
        let mut firefighter = responder("firefighter", north_of(NYC, 100.0), 5000.0);
        firefighter.capabilities = [EmergencyType::Fire].into_iter().collect();
        let myself = responder("victim", north_of(NYC, 10.0), 5000.0);

        let ranked = rank_candidates(
            NYC,
            EmergencyType::Medical,
            "victim",
            10_000.0,
            vec![off_duty, firefighter, myself],
        );

        assert!(ranked.is_empty());
    }

    #[test]
    fn test_rank_caps_radius_at_max() {
        let responders = vec![responder("r", north_of(NYC, 3000.0), 5000.0)];
        let ranked = rank_candidates(NYC, EmergencyType::Medical, "victim", 2000.0, responders);
        assert!(ranked.is_empty());
    }
}
