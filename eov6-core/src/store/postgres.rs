use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{PreviewReservation, SessionStore, StoreError};
use crate::models::{
    BackfillStatus, CallerDetails, ChatMessage, JobKind, JobRun, MeterBackfill, OrgEntitlement,
    Sender, Session, SessionRejection,
};

const SESSION_COLUMNS: &str = r#"
    code, status, created_at, expires_at, closed, closed_at, caller_joined_at,
    last_activity_at, org_id, agent_email, translate_preview_count, inserted_at
"#;

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_session(
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
    ) -> Result<Session, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions WHERE code = $1 FOR UPDATE",
            SESSION_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some(r) => r.try_into(),
            None => Err(StoreError::Rejected(SessionRejection::NotFound)),
        }
    }

    async fn codes(
        &self,
        sql: &str,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let codes: Vec<String> = sqlx::query_scalar(sql)
            .bind(at)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(codes)
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct SessionRow {
    code: String,
    status: String,
    created_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    closed: bool,
    closed_at: Option<DateTime<Utc>>,
    caller_joined_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    org_id: Option<String>,
    agent_email: Option<String>,
    translate_preview_count: i32,
    inserted_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(r: SessionRow) -> Result<Self, Self::Error> {
        let status = r
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("session {}: {}", r.code, e)))?;
        Ok(Session {
            code: r.code,
            status,
            created_at: r.created_at,
            expires_at: r.expires_at,
            closed: r.closed,
            closed_at: r.closed_at,
            caller_joined_at: r.caller_joined_at,
            last_activity_at: r.last_activity_at,
            org_id: r.org_id,
            agent_email: r.agent_email,
            translate_preview_count: r.translate_preview_count,
            inserted_at: r.inserted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    session_code: String,
    sender: String,
    text: String,
    translated_text: Option<String>,
    target_lang: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for ChatMessage {
    fn from(r: MessageRow) -> Self {
        let sender = if r.sender == "agent" {
            Sender::Agent
        } else {
            Sender::Caller
        };
        ChatMessage {
            id: r.id,
            session_code: r.session_code,
            sender,
            text: r.text,
            translated_text: r.translated_text,
            target_lang: r.target_lang,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BackfillRow {
    id: Uuid,
    session_code: String,
    email: Option<String>,
    customer_id: Option<String>,
    event_name: String,
    value: i64,
    identifier: String,
    reason: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BackfillRow> for MeterBackfill {
    type Error = StoreError;

    fn try_from(r: BackfillRow) -> Result<Self, Self::Error> {
        let status = BackfillStatus::parse(&r.status).ok_or_else(|| {
            StoreError::Corrupt(format!("meter_backfill {}: status {:?}", r.id, r.status))
        })?;
        Ok(MeterBackfill {
            id: r.id,
            session_code: r.session_code,
            email: r.email,
            customer_id: r.customer_id,
            event_name: r.event_name,
            value: r.value,
            identifier: r.identifier,
            reason: r.reason,
            status,
            attempts: r.attempts,
            last_error: r.last_error,
            next_attempt_at: r.next_attempt_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRunRow {
    id: Uuid,
    job: String,
    triggered_by: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    summary: serde_json::Value,
}

impl From<JobRunRow> for JobRun {
    fn from(r: JobRunRow) -> Self {
        JobRun {
            id: r.id,
            job: r.job,
            trigger: r.triggered_by,
            started_at: r.started_at,
            finished_at: r.finished_at,
            summary: r.summary,
        }
    }
}

// ============================================================================
// SessionStore impl
// ============================================================================

#[async_trait]
impl SessionStore for PgSessionStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn health(&self) -> Result<String, StoreError> {
        Ok(crate::db::health_check(&self.pool).await?)
    }

    async fn insert_session(&self, session: &Session) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (code, status, created_at, expires_at, closed, closed_at,
                                  caller_joined_at, last_activity_at, org_id, agent_email,
                                  translate_preview_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(&session.code)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.closed)
        .bind(session.closed_at)
        .bind(session.caller_joined_at)
        .bind(session.last_activity_at)
        .bind(&session.org_id)
        .bind(&session.agent_email)
        .bind(session.translate_preview_count)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_session(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions WHERE code = $1",
            SESSION_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn join_session(
        &self,
        code: &str,
        details: Option<&CallerDetails>,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut session = Self::lock_session(&mut tx, code).await?;
        // Dropping `tx` on the error path rolls back and releases the row lock.
        session.check_joinable(now)?;
        session.mark_joined(now);

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, caller_joined_at = $3, last_activity_at = $3
            WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(session.status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(d) = details.filter(|d| !d.is_empty()) {
            sqlx::query(
                r#"
                INSERT INTO session_details (session_code, name, email, phone, extra, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (session_code) DO UPDATE
                SET name = EXCLUDED.name, email = EXCLUDED.email, phone = EXCLUDED.phone,
                    extra = EXCLUDED.extra, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(code)
            .bind(&d.name)
            .bind(&d.email)
            .bind(&d.phone)
            .bind(if d.extra.is_null() { serde_json::json!({}) } else { d.extra.clone() })
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(session)
    }

    async fn close_session(&self, code: &str, now: DateTime<Utc>) -> Result<Session, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut session = Self::lock_session(&mut tx, code).await?;

        if !session.is_closed() || session.closed_at.is_none() {
            session.mark_closed(now);
            sqlx::query(
                r#"
                UPDATE sessions
                SET status = 'closed', closed = TRUE, closed_at = $2, last_activity_at = $3
                WHERE code = $1
                "#,
            )
            .bind(code)
            .bind(session.closed_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(session)
    }

    async fn reserve_preview(
        &self,
        code: &str,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<PreviewReservation, StoreError> {
        let mut tx = self.pool.begin().await?;
        let session = Self::lock_session(&mut tx, code).await?;
        session.check_active(now)?;

        if session.translate_preview_count >= limit {
            return Ok(PreviewReservation::Exhausted {
                count: session.translate_preview_count,
            });
        }

        let count: i32 = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET translate_preview_count = translate_preview_count + 1, last_activity_at = $2
            WHERE code = $1
            RETURNING translate_preview_count
            "#,
        )
        .bind(code)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PreviewReservation::Granted { count })
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO session_messages (id, session_code, sender, text, translated_text,
                                          target_lang, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id)
        .bind(&message.session_code)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(&message.translated_text)
        .bind(&message.target_lang)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET last_activity_at = $2 WHERE code = $1")
            .bind(&message.session_code)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(&self, code: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, session_code, sender, text, translated_text, target_lang, created_at
            FROM session_messages
            WHERE session_code = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(code)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    async fn get_details(&self, code: &str) -> Result<Option<CallerDetails>, StoreError> {
        let details: Option<CallerDetails> = sqlx::query_as(
            r#"
            SELECT session_code, name, email, phone, extra, updated_at
            FROM session_details
            WHERE session_code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(details)
    }

    async fn count_children(&self, code: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT (SELECT COUNT(*) FROM session_messages WHERE session_code = $1)
                 + (SELECT COUNT(*) FROM session_details WHERE session_code = $1)
            "#,
        )
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn delete_children_batch(&self, code: &str, batch: usize) -> Result<usize, StoreError> {
        let batch = batch.max(1) as i64;

        let messages = sqlx::query(
            r#"
            DELETE FROM session_messages
            WHERE id IN (
                SELECT id FROM session_messages WHERE session_code = $1 LIMIT $2
            )
            "#,
        )
        .bind(code)
        .bind(batch)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if messages > 0 {
            return Ok(messages as usize);
        }

        let details = sqlx::query("DELETE FROM session_details WHERE session_code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(details as usize)
    }

    async fn delete_session(&self, code: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_codes(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        self.codes(
            "SELECT code FROM sessions WHERE expires_at <= $1 ORDER BY expires_at ASC LIMIT $2",
            now,
            limit,
        )
        .await
    }

    async fn closed_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        self.codes(
            r#"
            SELECT code FROM sessions
            WHERE closed AND closed_at <= $1
            ORDER BY closed_at ASC
            LIMIT $2
            "#,
            cutoff,
            limit,
        )
        .await
    }

    async fn created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        self.codes(
            "SELECT code FROM sessions WHERE created_at <= $1 ORDER BY created_at ASC LIMIT $2",
            cutoff,
            limit,
        )
        .await
    }

    async fn untimestamped_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.codes(
            r#"
            SELECT code FROM sessions
            WHERE created_at IS NULL AND expires_at IS NULL AND inserted_at <= $1
            ORDER BY inserted_at ASC
            LIMIT $2
            "#,
            cutoff,
            limit,
        )
        .await
    }

    async fn entitlement_for_email(&self, email: &str) -> Result<Option<OrgEntitlement>, StoreError> {
        let ent: Option<OrgEntitlement> = sqlx::query_as(
            r#"
            SELECT email, org_id, plan, status, stripe_customer_id, updated_at
            FROM org_entitlements
            WHERE email = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ent)
    }

    async fn enqueue_backfill(&self, record: &MeterBackfill) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO meter_backfill (id, session_code, email, customer_id, event_name, value,
                                        identifier, reason, status, attempts, last_error,
                                        next_attempt_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (identifier) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.session_code)
        .bind(&record.email)
        .bind(&record.customer_id)
        .bind(&record.event_name)
        .bind(record.value)
        .bind(&record.identifier)
        .bind(&record.reason)
        .bind(record.status.as_str())
        .bind(record.attempts)
        .bind(&record.last_error)
        .bind(record.next_attempt_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_backfills(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MeterBackfill>, StoreError> {
        let rows: Vec<BackfillRow> = sqlx::query_as(
            r#"
            SELECT id, session_code, email, customer_id, event_name, value, identifier, reason,
                   status, attempts, last_error, next_attempt_at, created_at, updated_at
            FROM meter_backfill
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MeterBackfill::try_from).collect()
    }

    async fn update_backfill(&self, record: &MeterBackfill) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE meter_backfill
            SET customer_id = $2, status = $3, attempts = $4, last_error = $5,
                next_attempt_at = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.customer_id)
        .bind(record.status.as_str())
        .bind(record.attempts)
        .bind(&record.last_error)
        .bind(record.next_attempt_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_backfill_count(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM meter_backfill WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn record_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, job, triggered_by, started_at, finished_at, summary)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.id)
        .bind(&run.job)
        .bind(&run.trigger)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_job_run(&self, job: JobKind) -> Result<Option<JobRun>, StoreError> {
        let row: Option<JobRunRow> = sqlx::query_as(
            r#"
            SELECT id, job, triggered_by, started_at, finished_at, summary
            FROM job_runs
            WHERE job = $1
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .bind(job.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(JobRun::from))
    }
}

// ============================================================================
// TESTS (live database; skipped when unavailable)
// ============================================================================
