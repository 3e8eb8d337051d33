//! # Webhook Delivery
//!
//! A thin wrapper around `reqwest` that POSTs a serialized event to a
//! subscription's hook URL. One attempt per event: there is no retry, the
//! caller logs the outcome and moves on.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;
use thiserror::Error;

use crate::document::Document;

/// Value of the `User-Agent` header on every delivery.
pub const USER_AGENT_VALUE: &str = "Gerrit_Observatory";

/// Why a delivery did not succeed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// Connection, TLS or timeout failure.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The webhook answered outside [200, 400).
    #[error("webhook answered with status {0}")]
    Status(u16),
}

/// Returns true for the statuses a webhook may answer on success: [200, 400).
pub fn is_success_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// A reusable HTTP client for webhook POSTs.
///
/// Redirects are not followed so the status the hook itself returns decides
/// success.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    inner: reqwest::Client,
    timeout: Duration,
}

impl WebhookClient {
    /// Builds a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::none())
            .build()?;
        Ok(Self { inner, timeout })
    }

    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POSTs `doc` as JSON to `url` and returns the response status.
    pub async fn deliver(&self, url: &str, doc: &Document) -> Result<u16, DeliveryError> {
        let body = serde_json::to_vec(doc)?;
        let response = self
            .inner
            .post(url)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if is_success_status(status) {
            Ok(status)
        } else {
            Err(DeliveryError::Status(status))
        }
    }
}
