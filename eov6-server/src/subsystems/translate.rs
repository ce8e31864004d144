//! Translation gateway with preview allowance and usage metering
//!
//! Preview translations draw from a per-session free allowance. The slot is
//! reserved before the backend is called, so an exhausted session never
//! reaches the translation API. Commit translations are stored as chat
//! messages and metered best-effort; anything that prevents metering ends up
//! in the backfill queue instead of failing the request.

use chrono::{DateTime, Utc};
use eov6_core::models::{ChatMessage, NewBackfill, Sender};
use eov6_core::{PreviewReservation, UsageEvent};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::ApiError;
use crate::subsystems::backfill::resolve_customer;
use crate::subsystems::sessions::{active_session, parse_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslateMode {
    #[default]
    Preview,
    Commit,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub code: Option<String>,
    pub text: Option<String>,
    pub target: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub mode: TranslateMode,
    #[serde(default)]
    pub sender: Sender,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewUsage {
    pub preview_count: i32,
    pub limit: i32,
    pub remaining: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewResult {
    pub translated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_source: Option<String>,
    pub usage: PreviewUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub ok: bool,
    pub translated: String,
    pub message_id: String,
    pub metered: bool,
}

/// Why a commit could not be metered inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillReason {
    DetailsUnavailable,
    NoEmail,
    CustomerLookupFailed,
    NoCustomer,
    MeterFailed,
}

impl BackfillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillReason::DetailsUnavailable => "details_unavailable",
            BackfillReason::NoEmail => "no_email",
            BackfillReason::CustomerLookupFailed => "customer_lookup_failed",
            BackfillReason::NoCustomer => "no_customer",
            BackfillReason::MeterFailed => "meter_failed",
        }
    }
}

/// Validated translate request.
struct Job<'a> {
    code: String,
    text: &'a str,
    target: &'a str,
    source: Option<&'a str>,
}

fn validate(req: &TranslateRequest) -> Result<Job<'_>, ApiError> {
    let code = parse_code(req.code.as_deref())?;
    let text = req
        .text
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or(ApiError::BadRequest("missing_text"))?;
    let target = req
        .target
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::BadRequest("missing_target"))?;
    let source = req.source.as_deref().map(str::trim).filter(|s| !s.is_empty());
    Ok(Job {
        code,
        text,
        target,
        source,
    })
}

pub fn preview_limit(ctx: &AppContext) -> i32 {
    i32::try_from(ctx.config.translate.free_previews).unwrap_or(i32::MAX)
}

/// Spend one free preview and translate.
pub async fn preview(ctx: &AppContext, req: &TranslateRequest, now: DateTime<Utc>) -> Result<PreviewResult, ApiError> {
    let job = validate(req)?;
    active_session(ctx, &job.code, now).await?;

    let limit = preview_limit(ctx);
    let count = match ctx.store.reserve_preview(&job.code, limit, now).await? {
        PreviewReservation::Granted { count } => count,
        PreviewReservation::Exhausted { count } => {
            tracing::info!(code = %job.code, count, limit, "Preview allowance exhausted");
            return Err(ApiError::PreviewLimit { count, limit });
        }
    };

    // The slot stays spent even if the backend fails.
    let translation = ctx
        .translator
        .translate(job.text, job.target, job.source)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    Ok(PreviewResult {
        translated: translation.text,
        detected_source: translation.detected_source,
        usage: PreviewUsage {
            preview_count: count,
            limit,
            remaining: (limit - count).max(0),
        },
    })
}

/// Translate, store the message, and meter one usage event.
pub async fn commit(ctx: &AppContext, req: &TranslateRequest, now: DateTime<Utc>) -> Result<CommitResult, ApiError> {
    let job = validate(req)?;
    let session = active_session(ctx, &job.code, now).await?;

    let translation = ctx
        .translator
        .translate(job.text, job.target, job.source)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    let message = ChatMessage::translated(&session.code, req.sender, job.text, &translation.text, job.target, now);
    ctx.store.append_message(&message).await?;

    let metered = meter_commit(ctx, &message, now).await;

    Ok(CommitResult {
        ok: true,
        translated: translation.text,
        message_id: message.id.to_string(),
        metered,
    })
}

/// Record one usage event for `message`. Returns whether it was metered
/// inline; on any failure the event is queued for backfill.
pub async fn meter_commit(ctx: &AppContext, message: &ChatMessage, now: DateTime<Utc>) -> bool {
    let code = message.session_code.as_str();
    let identifier = message.id.to_string();

    let email = match ctx.store.get_details(code).await {
        Ok(details) => details.and_then(|d| d.billing_email()),
        Err(e) => {
            queue_backfill(ctx, message, None, None, BackfillReason::DetailsUnavailable, Some(e.to_string()), now).await;
            return false;
        }
    };
    let Some(email) = email else {
        queue_backfill(ctx, message, None, None, BackfillReason::NoEmail, None, now).await;
        return false;
    };

    let customer_id = match resolve_customer(ctx, &email).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            queue_backfill(ctx, message, Some(email), None, BackfillReason::NoCustomer, None, now).await;
            return false;
        }
        Err(e) => {
            queue_backfill(
                ctx,
                message,
                Some(email),
                None,
                BackfillReason::CustomerLookupFailed,
                Some(e.to_string()),
                now,
            )
            .await;
            return false;
        }
    };

    let event = UsageEvent {
        event_name: ctx.config.billing.meter_event_name.clone(),
        customer_id: customer_id.clone(),
        value: 1,
        identifier,
        timestamp: now,
    };
    match ctx.meter.record_usage(&event).await {
        Ok(()) => {
            tracing::debug!(code = %code, customer = %customer_id, "Usage metered");
            true
        }
        Err(e) => {
            queue_backfill(
                ctx,
                message,
                Some(email),
                Some(customer_id),
                BackfillReason::MeterFailed,
                Some(e.to_string()),
                now,
            )
            .await;
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn queue_backfill(
    ctx: &AppContext,
    message: &ChatMessage,
    email: Option<String>,
    customer_id: Option<String>,
    reason: BackfillReason,
    detail: Option<String>,
    now: DateTime<Utc>,
) {
    let mut record = NewBackfill {
        session_code: message.session_code.clone(),
        email,
        customer_id,
        event_name: ctx.config.billing.meter_event_name.clone(),
        value: 1,
        identifier: message.id.to_string(),
        reason: reason.as_str().to_string(),
    }
    .into_record(now);
    record.last_error = detail;

    match ctx.store.enqueue_backfill(&record).await {
        Ok(()) => tracing::warn!(
            code = %record.session_code,
            reason = reason.as_str(),
            error = ?record.last_error,
            "Usage not metered; queued for backfill"
        ),
        Err(e) => tracing::error!(
            code = %record.session_code,
            identifier = %record.identifier,
            error = %e,
            "Failed to queue usage backfill; event lost"
        ),
    }
}
