use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Cleanup,
    MeterBackfill,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Cleanup => "cleanup",
            JobKind::MeterBackfill => "meter_backfill",
        }
    }
}

/// Who started a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Cron,
    Staff,
    Worker,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Cron => "cron",
            JobTrigger::Staff => "staff",
            JobTrigger::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job: String,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: serde_json::Value,
}

impl JobRun {
    pub fn new(
        job: JobKind,
        trigger: JobTrigger,
        started_at: DateTime<Utc>,
        summary: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: job.as_str().to_string(),
            trigger: trigger.as_str().to_string(),
            started_at,
            finished_at: Utc::now(),
            summary,
        }
    }
}
