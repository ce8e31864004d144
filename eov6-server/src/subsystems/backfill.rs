//! Meter backfill reconciler
//!
//! Drains the `meter_backfill` queue: every due pending record gets one more
//! attempt at recording its usage event under the original identifier. A
//! failed attempt is rescheduled with exponential backoff; once
//! `backfill_max_attempts` is reached the record is marked failed and left for
//! manual review.

use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use eov6_core::models::{next_attempt_delay, BackfillStatus, JobKind, JobRun, JobTrigger, MeterBackfill};
use eov6_core::{MeterError, UsageEvent};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::context::AppContext;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub scanned: usize,
    pub recorded: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

/// Billing customer for `email`: a known entitlement customer first, then the
/// provider's customer search.
pub async fn resolve_customer(ctx: &AppContext, email: &str) -> Result<Option<String>, MeterError> {
    match ctx.store.entitlement_for_email(email).await {
        Ok(Some(ent)) => {
            if let Some(id) = ent.stripe_customer_id.filter(|id| !id.is_empty()) {
                return Ok(Some(id));
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Entitlement lookup failed; falling back to customer search"),
    }
    ctx.meter.find_customer(email).await
}

/// One attempt for one record. Returns the customer id used.
async fn attempt(ctx: &AppContext, record: &mut MeterBackfill) -> Result<String, String> {
    if record.email.is_none() {
        match ctx.store.get_details(&record.session_code).await {
            Ok(details) => record.email = details.and_then(|d| d.billing_email()),
            Err(e) => return Err(format!("details unavailable: {}", e)),
        }
    }

    let customer_id = match record.customer_id.clone() {
        Some(id) => id,
        None => {
            let email = record.email.clone().ok_or_else(|| "no billing email".to_string())?;
            let id = resolve_customer(ctx, &email)
                .await
                .map_err(|e| format!("customer lookup failed: {}", e))?
                .ok_or_else(|| format!("no billing customer for {}", email))?;
            record.customer_id = Some(id.clone());
            id
        }
    };

    let event = UsageEvent {
        event_name: record.event_name.clone(),
        customer_id: customer_id.clone(),
        value: record.value,
        identifier: record.identifier.clone(),
        timestamp: record.created_at,
    };
    ctx.meter
        .record_usage(&event)
        .await
        .map_err(|e| format!("meter event failed: {}", e))?;
    Ok(customer_id)
}

/// Apply the outcome of one attempt to `record`.
pub fn settle(
    record: &mut MeterBackfill,
    outcome: Result<(), String>,
    max_attempts: i32,
    base_delay_secs: i64,
    now: DateTime<Utc>,
) {
    record.attempts += 1;
    record.updated_at = now;
    match outcome {
        Ok(()) => {
            record.status = BackfillStatus::Done;
            record.last_error = None;
        }
        Err(e) => {
            record.last_error = Some(e);
            if record.attempts >= max_attempts {
                record.status = BackfillStatus::Failed;
            } else {
                record.next_attempt_at = now + next_attempt_delay(base_delay_secs, record.attempts - 1);
            }
        }
    }
}

/// Process up to `backfill_batch_size` due records.
pub async fn run_backfill_tick(ctx: &AppContext, now: DateTime<Utc>) -> Result<BackfillReport> {
    let started = Instant::now();
    let billing = &ctx.config.billing;
    let due = ctx.store.due_backfills(now, billing.backfill_batch_size).await?;

    let mut report = BackfillReport {
        scanned: due.len(),
        ..Default::default()
    };

    for mut record in due {
        let outcome = attempt(ctx, &mut record).await.map(|_| ());
        settle(
            &mut record,
            outcome,
            billing.backfill_max_attempts,
            billing.backfill_base_delay_secs,
            now,
        );

        match record.status {
            BackfillStatus::Done => report.recorded += 1,
            BackfillStatus::Failed => {
                tracing::error!(
                    identifier = %record.identifier,
                    code = %record.session_code,
                    attempts = record.attempts,
                    error = ?record.last_error,
                    "Usage backfill gave up"
                );
                report.failed += 1;
            }
            BackfillStatus::Pending => report.rescheduled += 1,
        }

        if let Err(e) = ctx.store.update_backfill(&record).await {
            report.errors.push(format!("{}: {}", record.identifier, e));
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}

/// One tick, recorded as a job run.
pub async fn run_backfill_job(ctx: &AppContext, trigger: JobTrigger) -> Result<BackfillReport> {
    let started_at = Utc::now();
    let report = run_backfill_tick(ctx, started_at).await?;

    if report.scanned > 0 {
        tracing::info!(
            scanned = report.scanned,
            recorded = report.recorded,
            rescheduled = report.rescheduled,
            failed = report.failed,
            "Backfill tick complete"
        );
    }

    let run = JobRun::new(JobKind::MeterBackfill, trigger, started_at, serde_json::to_value(&report)?);
    if let Err(e) = ctx.store.record_job_run(&run).await {
        tracing::warn!(error = %e, "Failed to record backfill run");
    }
    Ok(report)
}

/// Background worker. Exits immediately when disabled, otherwise ticks until
/// the shutdown signal fires.
pub async fn run_backfill_worker(ctx: std::sync::Arc<AppContext>, mut shutdown: broadcast::Receiver<()>) {
    let billing = &ctx.config.billing;
    if !billing.backfill_worker_enabled {
        tracing::info!("Backfill worker disabled via config");
        return;
    }

    let mut ticker = interval(Duration::from_secs(billing.backfill_interval_minutes.max(1) * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_min = billing.backfill_interval_minutes,
        batch_size = billing.backfill_batch_size,
        "Backfill worker started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_backfill_job(&ctx, JobTrigger::Worker).await {
                    tracing::warn!(error = %e, "Backfill tick failed");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Backfill worker shutting down");
                break;
            }
        }
    }
}
