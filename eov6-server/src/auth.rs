//! Request authorization
//!
//! Job endpoints accept either the shared cron secret or a staff ID token.
//! Agent endpoints accept an ID token only.

use axum::http::HeaderMap;
use eov6_core::models::JobTrigger;
use eov6_core::{Identity, IdentityError};

use crate::context::AppContext;
use crate::error::ApiError;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Who triggered a job request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCaller {
    Cron,
    Staff { email: String },
}

impl JobCaller {
    pub fn trigger(&self) -> JobTrigger {
        match self {
            JobCaller::Cron => JobTrigger::Cron,
            JobCaller::Staff { .. } => JobTrigger::Staff,
        }
    }
}

/// Credential found on a job request, in lookup order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCredential {
    SharedSecret(String),
    Bearer(String),
}

/// `x-cron-secret` header, then `?secret=`, then `Authorization: Bearer`.
pub fn job_credential(headers: &HeaderMap, query_secret: Option<&str>) -> Option<JobCredential> {
    if let Some(secret) = header_str(headers, CRON_SECRET_HEADER).filter(|s| !s.is_empty()) {
        return Some(JobCredential::SharedSecret(secret.to_string()));
    }
    if let Some(secret) = query_secret.filter(|s| !s.is_empty()) {
        return Some(JobCredential::SharedSecret(secret.to_string()));
    }
    bearer_token(headers).map(|t| JobCredential::Bearer(t.to_string()))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authorize a job request.
///
/// 401 when no credential is present or the ID token is invalid; 403 when the
/// secret is wrong or the token belongs to a non-staff account. A bearer value
/// equal to the cron secret is accepted as the secret.
pub async fn authorize_job(
    ctx: &AppContext,
    headers: &HeaderMap,
    query_secret: Option<&str>,
) -> Result<JobCaller, ApiError> {
    let expected = ctx.config.auth.cron_secret.as_str();

    match job_credential(headers, query_secret) {
        None => Err(ApiError::Unauthorized),
        Some(JobCredential::SharedSecret(secret)) => {
            if secret_matches(&secret, expected) {
                Ok(JobCaller::Cron)
            } else {
                tracing::warn!("Job request with wrong shared secret");
                Err(ApiError::Forbidden)
            }
        }
        Some(JobCredential::Bearer(token)) => {
            if secret_matches(&token, expected) {
                return Ok(JobCaller::Cron);
            }
            let identity = verify_token(ctx, &token).await?;
            match identity.email {
                Some(email) if ctx.config.is_staff(&email) => Ok(JobCaller::Staff { email }),
                other => {
                    tracing::warn!(uid = %identity.uid, email = ?other, "Job request from non-staff account");
                    Err(ApiError::Forbidden)
                }
            }
        }
    }
}

/// Verify the agent's bearer ID token.
pub async fn authenticate_agent(ctx: &AppContext, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    verify_token(ctx, token).await
}

async fn verify_token(ctx: &AppContext, token: &str) -> Result<Identity, ApiError> {
    match ctx.identity.verify(token).await {
        Ok(identity) => Ok(identity),
        Err(IdentityError::InvalidToken) => Err(ApiError::Unauthorized),
        Err(e @ (IdentityError::Unavailable(_) | IdentityError::MissingApiKey)) => {
            tracing::warn!(error = %e, "Bearer token refused");
            Err(ApiError::Unauthorized)
        }
        Err(e) => Err(ApiError::Upstream(e.to_string())),
    }
}

/// An empty expected secret never matches.
fn secret_matches(given: &str, expected: &str) -> bool {
    !expected.is_empty() && constant_time_eq(given.as_bytes(), expected.as_bytes())
}

/// Constant-time byte comparison to prevent timing attacks on secret auth.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
