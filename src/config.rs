//! Runtime configuration, read from the environment.
//!
//! Every key is optional. A `.env` file in the working directory is honoured.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:lifeline.db?mode=rwc";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub port: u16,
    pub database_url: String,
    /// How long an alert may stay `pending` before it expires.
    pub expiry_deadline: Duration,
    /// Bound on a single eligible-responder query.
    pub geo_timeout: Duration,
    /// Background matching retries after a timed-out query.
    pub geo_retry_attempts: u32,
    /// First retry delay; doubled on every further attempt.
    pub geo_retry_base_delay: Duration,
    /// Ceiling on any responder's notification radius, in meters.
    pub max_radius_m: f64,
    /// Radius used when a responder does not set one, in meters.
    pub default_radius_m: f64,
    pub description_max_chars: usize,
    /// Reject a new alert while the requester still has an active one.
    pub single_active_alert: bool,
    /// Buffer size of every notification topic.
    pub channel_capacity: usize,
    /// Optional push gateway that receives every fan-out notification.
    pub webhook_url: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            expiry_deadline: Duration::from_secs(600),
            geo_timeout: Duration::from_millis(2000),
            geo_retry_attempts: 3,
            geo_retry_base_delay: Duration::from_millis(500),
            max_radius_m: 10_000.0,
            default_radius_m: 5_000.0,
            description_max_chars: 1000,
            single_active_alert: true,
            channel_capacity: 256,
            webhook_url: None,
        }
    }
}

impl DispatchConfig {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let webhook_url = env::var("LIFELINE_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Self {
            port: parse_var("LIFELINE_PORT").unwrap_or(defaults.port),
            database_url: env::var("LIFELINE_DATABASE_URL").unwrap_or(defaults.database_url),
            expiry_deadline: parse_var("LIFELINE_EXPIRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.expiry_deadline),
            geo_timeout: parse_var("LIFELINE_GEO_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.geo_timeout),
            geo_retry_attempts: parse_var("LIFELINE_GEO_RETRY_ATTEMPTS")
                .unwrap_or(defaults.geo_retry_attempts),
            geo_retry_base_delay: parse_var("LIFELINE_GEO_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.geo_retry_base_delay),
            max_radius_m: parse_var("LIFELINE_MAX_RADIUS_M").unwrap_or(defaults.max_radius_m),
            default_radius_m: parse_var("LIFELINE_DEFAULT_RADIUS_M")
                .unwrap_or(defaults.default_radius_m),
            description_max_chars: parse_var("LIFELINE_DESCRIPTION_MAX")
                .unwrap_or(defaults.description_max_chars),
            single_active_alert: parse_var("LIFELINE_SINGLE_ACTIVE_ALERT")
                .unwrap_or(defaults.single_active_alert),
            channel_capacity: parse_var("LIFELINE_CHANNEL_CAPACITY")
                .unwrap_or(defaults.channel_capacity),
            webhook_url,
        }
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    parse_value(env::var(key).ok().as_deref())
}

/// Parse a raw setting, treating absent or unparsable values as unset.
fn parse_value<T: FromStr>(raw: Option<&str>) -> Option<T> {
    raw.and_then(|v| v.trim().parse().ok())
}
