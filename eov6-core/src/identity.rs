//! Bearer ID-token verification
//!
//! Agents and staff authenticate with identity-provider ID tokens. The Firebase
//! client resolves a token through the Identity Toolkit `accounts:lookup`
//! endpoint, which rejects expired or forged tokens.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: Option<String>,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid or expired ID token")]
    InvalidToken,

    #[error("Identity API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Identity verification unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<Identity, IdentityError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    id_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupErrorResponse {
    error: Option<LookupErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct LookupErrorDetail {
    code: u16,
    message: String,
}

#[derive(Debug, Clone)]
pub struct FirebaseIdentityClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl FirebaseIdentityClient {
    pub fn new(config: &AuthConfig) -> Result<Self, IdentityError> {
        Self::with_base_url(config, config.identity_base_url.clone())
    }

    /// Create a client against a custom endpoint (for testing / integration)
    pub fn with_base_url(config: &AuthConfig, base_url: String) -> Result<Self, IdentityError> {
        if config.firebase_api_key.is_empty() {
            return Err(IdentityError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: config.firebase_api_key.clone(),
            base_url,
        })
    }
}

#[async_trait]
impl IdentityVerifier for FirebaseIdentityClient {
    async fn verify(&self, id_token: &str) -> Result<Identity, IdentityError> {
        if id_token.trim().is_empty() {
            return Err(IdentityError::InvalidToken);
        }

        let response = self
            .client
            .post(format!("{}/accounts:lookup", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&LookupRequest { id_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<LookupErrorResponse>(&body)
                .ok()
                .and_then(|e| e.error);
            return match detail {
                Some(d) if d.message.contains("INVALID_ID_TOKEN") || d.message.contains("TOKEN_EXPIRED") => {
                    Err(IdentityError::InvalidToken)
                }
                Some(d) => Err(IdentityError::Api {
                    code: d.code,
                    message: d.message,
                }),
                None if status.as_u16() == 400 => Err(IdentityError::InvalidToken),
                None => Err(IdentityError::Api {
                    code: status.as_u16(),
                    message: body,
                }),
            };
        }

        let body: LookupResponse = response.json().await?;
        let user = body
            .users
            .into_iter()
            .next()
            .ok_or(IdentityError::InvalidToken)?;

        Ok(Identity {
            uid: user.local_id,
            email: user.email.map(|e| e.to_lowercase()),
        })
    }

    fn name(&self) -> &str {
        "firebase"
    }
}

/// Stand-in used when no identity API key is configured; every token is refused.
#[derive(Debug, Clone)]
pub struct UnavailableIdentity {
    reason: String,
}

impl UnavailableIdentity {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for UnavailableIdentity {
    async fn verify(&self, _id_token: &str) -> Result<Identity, IdentityError> {
        Err(IdentityError::Unavailable(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}
