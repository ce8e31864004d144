//! Translation backend
//!
//! `Translator` abstracts the external translation API. The production client
//! talks to Google Cloud Translation v2 (`GOOGLE_TRANSLATE_API_KEY`), retrying
//! transient failures (429/5xx/network) with exponential backoff and jitter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::TranslateConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub detected_source: Option<String>,
}

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing translation in response")]
    MissingTranslation,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Translation unavailable: {0}")]
    Unavailable(String),
}

impl TranslateError {
    fn is_transient(&self) -> bool {
        match self {
            TranslateError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TranslateError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<Translation, TranslateError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Google API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct GoogleRequest<'a> {
    q: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    data: GoogleData,
}

#[derive(Debug, Deserialize)]
struct GoogleData {
    translations: Vec<GoogleTranslation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTranslation {
    translated_text: String,
    detected_source_language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
    error: Option<GoogleErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    code: u16,
    message: String,
}

// ============================================================================
// GoogleTranslateClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct GoogleTranslateClient {
    client: Client,
    config: TranslateConfig,
}

impl GoogleTranslateClient {
    pub fn new(config: TranslateConfig) -> Result<Self, TranslateError> {
        if config.api_key.is_empty() {
            return Err(TranslateError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a client against a custom endpoint (for testing / integration)
    pub fn with_base_url(mut config: TranslateConfig, base_url: String) -> Result<Self, TranslateError> {
        config.base_url = base_url;
        Self::new(config)
    }

    async fn translate_once(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<Translation, TranslateError> {
        let request = GoogleRequest {
            q: text,
            target,
            source,
            format: "text",
        };

        let response = self
            .client
            .post(&self.config.base_url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let (code, message) = serde_json::from_str::<GoogleErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| (e.code, e.message))
                .unwrap_or((status.as_u16(), error_body));

            tracing::warn!(code = code, message = %message, "Translation API error");
            return Err(TranslateError::Api { code, message });
        }

        let body: GoogleResponse = response.json().await?;
        let first = body
            .data
            .translations
            .into_iter()
            .next()
            .ok_or(TranslateError::MissingTranslation)?;

        Ok(Translation {
            text: first.translated_text,
            detected_source: first.detected_source_language,
        })
    }
}

#[async_trait]
impl Translator for GoogleTranslateClient {
    async fn translate(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<Translation, TranslateError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(
            retry_strategy,
            || self.translate_once(text, target, source),
            TranslateError::is_transient,
        )
        .await
    }

    fn name(&self) -> &str {
        "google"
    }
}

/// Stand-in used when no API key is configured; every call fails.
#[derive(Debug, Clone)]
pub struct UnavailableTranslator {
    reason: String,
}

impl UnavailableTranslator {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Translator for UnavailableTranslator {
    async fn translate(
        &self,
        _text: &str,
        _target: &str,
        _source: Option<&str>,
    ) -> Result<Translation, TranslateError> {
        Err(TranslateError::Unavailable(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

// ============================================================================
// TESTS
// ============================================================================
