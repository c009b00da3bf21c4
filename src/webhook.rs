//! Optional relay of fan-out notifications to an external push gateway.
//!
//! The gateway owns device delivery (push, SMS, email). From the core's point
//! of view a relay is fire-and-forget: failures are retried with backoff,
//! logged, and never reported back to the caller that raised the alert.

use std::time::Duration;

use serde_json::json;

use crate::notify::Notification;

/// Retry delays in milliseconds (exponential backoff).
const RETRY_DELAYS_MS: [u64; 3] = [250, 500, 1000];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The gateway returned a non-2xx status code.
    #[error("gateway returned HTTP {0}")]
    HttpStatus(u16),
}

/// POSTs notifications for individual recipients to a fixed URL.
#[derive(Clone)]
pub struct WebhookRelay {
    client: reqwest::Client,
    url: String,
}

impl WebhookRelay {
    pub fn new(url: impl Into<String>) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver `notification` for `recipient_id`, retrying with backoff.
    pub async fn deliver(
        &self,
        recipient_id: &str,
        notification: &Notification,
    ) -> Result<(), WebhookError> {
        let payload = json!({
            "recipient_id": recipient_id,
            "notification": notification,
        });

        let mut delays = RETRY_DELAYS_MS.iter();
        let mut attempt = 1;
        loop {
            let err = match self.try_send(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let Some(delay_ms) = delays.next() else {
                return Err(err);
            };
            tracing::debug!(
                attempt,
                recipient_id,
                error = %err,
                "Webhook delivery attempt failed, retrying"
            );
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            attempt += 1;
        }
    }

    async fn try_send(&self, payload: &serde_json::Value) -> Result<(), WebhookError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}
