use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on the retry delay for a queued metering event.
pub const MAX_BACKFILL_DELAY_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Pending,
    Done,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Done => "done",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BackfillStatus::Pending),
            "done" => Some(BackfillStatus::Done),
            "failed" => Some(BackfillStatus::Failed),
            _ => None,
        }
    }
}

/// A metering event that could not be recorded live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterBackfill {
    pub id: Uuid,
    pub session_code: String,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub event_name: String,
    pub value: i64,
    /// Idempotency key forwarded to the billing provider.
    pub identifier: String,
    pub reason: String,
    pub status: BackfillStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when enqueueing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBackfill {
    pub session_code: String,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub event_name: String,
    pub value: i64,
    pub identifier: String,
    pub reason: String,
}

impl NewBackfill {
    pub fn into_record(self, now: DateTime<Utc>) -> MeterBackfill {
        MeterBackfill {
            id: Uuid::new_v4(),
            session_code: self.session_code,
            email: self.email,
            customer_id: self.customer_id,
            event_name: self.event_name,
            value: self.value,
            identifier: self.identifier,
            reason: self.reason,
            status: BackfillStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Exponential backoff for the next reconciliation attempt, capped at one day.
pub fn next_attempt_delay(base_delay_secs: i64, attempts: i32) -> Duration {
    let shift = attempts.clamp(0, 30) as u32;
    let secs = base_delay_secs
        .max(1)
        .saturating_mul(1i64 << shift)
        .min(MAX_BACKFILL_DELAY_SECS);
    Duration::seconds(secs)
}
