//! Session record accessor
//!
//! `SessionStore` is the seam between handlers and persistence. Two backends:
//! - **Postgres** (`PgSessionStore`): production; transactions give the
//!   at-most-once join and the bounded preview counter.
//! - **Memory** (`MemoryStore`): development and tests; one async mutex
//!   serializes every operation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{DatabaseConfig, StoreBackend};
use crate::error::Eov6Error;
use crate::models::{
    CallerDetails, ChatMessage, JobKind, JobRun, MeterBackfill, OrgEntitlement, Session,
    SessionRejection,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgSessionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Rejected(SessionRejection),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<SessionRejection> for StoreError {
    fn from(r: SessionRejection) -> Self {
        StoreError::Rejected(r)
    }
}

/// Outcome of trying to take one free preview slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewReservation {
    /// Slot taken; `count` is the counter after the increment.
    Granted { count: i32 },
    /// No slot left; the counter was not touched.
    Exhausted { count: i32 },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name for logging and health output.
    fn name(&self) -> &str;

    async fn health(&self) -> Result<String, StoreError>;

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Insert a new record. Returns `false` if the code is already taken.
    async fn insert_session(&self, session: &Session) -> Result<bool, StoreError>;

    async fn get_session(&self, code: &str) -> Result<Option<Session>, StoreError>;

    /// Transactional read-check-write: exactly one caller wins per session.
    /// Caller details, when given, are written in the same transaction.
    async fn join_session(
        &self,
        code: &str,
        details: Option<&CallerDetails>,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError>;

    /// Mark closed. Closing an already closed session is a no-op.
    async fn close_session(&self, code: &str, now: DateTime<Utc>) -> Result<Session, StoreError>;

    /// Atomically take a preview slot if the counter is below `limit`.
    /// The counter only ever grows.
    async fn reserve_preview(
        &self,
        code: &str,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<PreviewReservation, StoreError>;

    // ------------------------------------------------------------------
    // Child records
    // ------------------------------------------------------------------

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    async fn list_messages(&self, code: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    async fn get_details(&self, code: &str) -> Result<Option<CallerDetails>, StoreError>;

    /// Number of child records (messages + details) still stored for `code`.
    async fn count_children(&self, code: &str) -> Result<usize, StoreError>;

    /// Delete at most `batch` child records. Returns how many were removed;
    /// zero means none are left.
    async fn delete_children_batch(&self, code: &str, batch: usize) -> Result<usize, StoreError>;

    async fn delete_session(&self, code: &str) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Cleanup candidate queries (oldest first, at most `limit`)
    // ------------------------------------------------------------------

    async fn expired_codes(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn closed_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Records with neither `created_at` nor `expires_at`, aged by the
    /// store-assigned insert time.
    async fn untimestamped_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    // ------------------------------------------------------------------
    // Entitlements
    // ------------------------------------------------------------------

    async fn entitlement_for_email(&self, email: &str) -> Result<Option<OrgEntitlement>, StoreError>;

    // ------------------------------------------------------------------
    // Metering backfill queue
    // ------------------------------------------------------------------

    /// Enqueue unless a record with the same identifier already exists.
    async fn enqueue_backfill(&self, record: &MeterBackfill) -> Result<(), StoreError>;

    async fn due_backfills(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MeterBackfill>, StoreError>;

    async fn update_backfill(&self, record: &MeterBackfill) -> Result<(), StoreError>;

    async fn pending_backfill_count(&self) -> Result<i64, StoreError>;

    // ------------------------------------------------------------------
    // Job runs
    // ------------------------------------------------------------------

    async fn record_job_run(&self, run: &JobRun) -> Result<(), StoreError>;

    async fn last_job_run(&self, job: JobKind) -> Result<Option<JobRun>, StoreError>;
}

/// Build the configured backend. Postgres connections run pending migrations.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn SessionStore>, Eov6Error> {
    match config.backend {
        StoreBackend::Postgres => {
            let pool = crate::db::create_pool(config).await?;
            crate::db::run_migrations(&pool).await?;
            tracing::info!(max_connections = config.max_connections, "Postgres session store ready");
            Ok(Arc::new(PgSessionStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory session store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
