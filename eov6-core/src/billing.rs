//! Usage metering against the billing provider
//!
//! `MeterBackend` resolves billing customers by email and records usage events.
//! The Stripe client uses the customers list endpoint and Billing Meter Events;
//! every event carries an `identifier` so replays from the backfill queue are
//! deduplicated provider-side.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::BillingConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub event_name: String,
    pub customer_id: String,
    pub value: i64,
    pub identifier: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Billing API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Metering unavailable: {0}")]
    Unavailable(String),
}

impl MeterError {
    fn is_transient(&self) -> bool {
        match self {
            MeterError::Http(e) => e.is_timeout() || e.is_connect(),
            MeterError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait MeterBackend: Send + Sync {
    /// Billing customer id for `email`, if one exists.
    async fn find_customer(&self, email: &str) -> Result<Option<String>, MeterError>;

    async fn record_usage(&self, event: &UsageEvent) -> Result<(), MeterError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Stripe
// ============================================================================

#[derive(Debug, Deserialize)]
struct CustomerList {
    data: Vec<CustomerObject>,
}

#[derive(Debug, Deserialize)]
struct CustomerObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: Option<StripeErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StripeMeterClient {
    client: Client,
    config: BillingConfig,
}

impl StripeMeterClient {
    pub fn new(config: BillingConfig) -> Result<Self, MeterError> {
        if config.stripe_secret_key.is_empty() {
            return Err(MeterError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a client against a custom endpoint (for testing / integration)
    pub fn with_base_url(mut config: BillingConfig, base_url: String) -> Result<Self, MeterError> {
        config.base_url = base_url;
        Self::new(config)
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, MeterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StripeErrorResponse>(&body)
            .ok()
            .and_then(|e| e.error)
            .and_then(|e| e.message)
            .unwrap_or(body);
        tracing::warn!(status = status.as_u16(), message = %message, "Billing API error");
        Err(MeterError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn find_customer_once(&self, email: &str) -> Result<Option<String>, MeterError> {
        let response = self
            .client
            .get(format!("{}/v1/customers", self.config.base_url))
            .bearer_auth(&self.config.stripe_secret_key)
            .query(&[("email", email), ("limit", "1")])
            .send()
            .await?;

        let list: CustomerList = Self::check(response).await?.json().await?;
        Ok(list.data.into_iter().next().map(|c| c.id))
    }

    async fn record_usage_once(&self, event: &UsageEvent) -> Result<(), MeterError> {
        let form = [
            ("event_name", event.event_name.clone()),
            ("identifier", event.identifier.clone()),
            ("timestamp", event.timestamp.timestamp().to_string()),
            ("payload[stripe_customer_id]", event.customer_id.clone()),
            ("payload[value]", event.value.to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/v1/billing/meter_events", self.config.base_url))
            .bearer_auth(&self.config.stripe_secret_key)
            .form(&form)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl MeterBackend for StripeMeterClient {
    async fn find_customer(&self, email: &str) -> Result<Option<String>, MeterError> {
        RetryIf::spawn(
            self.retry_strategy(),
            || self.find_customer_once(email),
            MeterError::is_transient,
        )
        .await
    }

    async fn record_usage(&self, event: &UsageEvent) -> Result<(), MeterError> {
        RetryIf::spawn(
            self.retry_strategy(),
            || self.record_usage_once(event),
            MeterError::is_transient,
        )
        .await
    }

    fn name(&self) -> &str {
        "stripe"
    }
}

/// Stand-in used when no billing key is configured; every event is queued.
#[derive(Debug, Clone)]
pub struct UnavailableMeter {
    reason: String,
}

impl UnavailableMeter {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MeterBackend for UnavailableMeter {
    async fn find_customer(&self, _email: &str) -> Result<Option<String>, MeterError> {
        Err(MeterError::Unavailable(self.reason.clone()))
    }

    async fn record_usage(&self, _event: &UsageEvent) -> Result<(), MeterError> {
        Err(MeterError::Unavailable(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

// ============================================================================
// TESTS
// ============================================================================
