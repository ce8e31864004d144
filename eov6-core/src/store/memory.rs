use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{PreviewReservation, SessionStore, StoreError};
use crate::models::{
    BackfillStatus, CallerDetails, ChatMessage, JobKind, JobRun, MeterBackfill, OrgEntitlement,
    Session, SessionRejection,
};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<ChatMessage>>,
    details: HashMap<String, CallerDetails>,
    entitlements: HashMap<String, OrgEntitlement>,
    backfills: Vec<MeterBackfill>,
    job_runs: Vec<JobRun>,
}

impl MemoryState {
    fn session_mut(&mut self, code: &str) -> Result<&mut Session, StoreError> {
        self.sessions
            .get_mut(code)
            .ok_or(StoreError::Rejected(SessionRejection::NotFound))
    }

    /// Oldest-first codes of sessions whose `key` timestamp is at or before `at`.
    fn codes_by<F>(&self, at: DateTime<Utc>, limit: usize, key: F) -> Vec<String>
    where
        F: Fn(&Session) -> Option<DateTime<Utc>>,
    {
        let mut hits: Vec<(DateTime<Utc>, &String)> = self
            .sessions
            .iter()
            .filter_map(|(code, s)| key(s).filter(|t| *t <= at).map(|t| (t, code)))
            .collect();
        hits.sort();
        hits.into_iter()
            .take(limit)
            .map(|(_, code)| code.clone())
            .collect()
    }
}

/// Process-local store. Every operation holds a single mutex, which makes each
/// call behave like a serializable transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entitlements are written by billing webhooks elsewhere; this seeds them
    /// for development.
    pub async fn put_entitlement(&self, entitlement: OrgEntitlement) {
        let mut state = self.state.lock().await;
        state
            .entitlements
            .insert(entitlement.email.to_lowercase(), entitlement);
    }

    pub async fn put_details(&self, details: CallerDetails) {
        let mut state = self.state.lock().await;
        state.details.insert(details.session_code.clone(), details);
    }

    pub async fn backfills(&self) -> Vec<MeterBackfill> {
        self.state.lock().await.backfills.clone()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<String, StoreError> {
        let state = self.state.lock().await;
        Ok(format!("memory ({} sessions)", state.sessions.len()))
    }

    async fn insert_session(&self, session: &Session) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.code) {
            return Ok(false);
        }
        state.sessions.insert(session.code.clone(), session.clone());
        Ok(true)
    }

    async fn get_session(&self, code: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.state.lock().await.sessions.get(code).cloned())
    }

    async fn join_session(
        &self,
        code: &str,
        details: Option<&CallerDetails>,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(code)?;
        session.check_joinable(now)?;
        session.mark_joined(now);
        let joined = session.clone();

        if let Some(d) = details.filter(|d| !d.is_empty()) {
            let mut d = d.clone();
            d.session_code = code.to_string();
            d.updated_at = now;
            state.details.insert(code.to_string(), d);
        }
        Ok(joined)
    }

    async fn close_session(&self, code: &str, now: DateTime<Utc>) -> Result<Session, StoreError> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(code)?;
        session.mark_closed(now);
        Ok(session.clone())
    }

    async fn reserve_preview(
        &self,
        code: &str,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<PreviewReservation, StoreError> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(code)?;
        session.check_active(now)?;

        if session.translate_preview_count >= limit {
            return Ok(PreviewReservation::Exhausted {
                count: session.translate_preview_count,
            });
        }
        session.translate_preview_count += 1;
        session.last_activity_at = Some(now);
        Ok(PreviewReservation::Granted {
            count: session.translate_preview_count,
        })
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(s) = state.sessions.get_mut(&message.session_code) {
            s.last_activity_at = Some(message.created_at);
        }
        state
            .messages
            .entry(message.session_code.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, code: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .get(code)
            .map(|m| m.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_details(&self, code: &str) -> Result<Option<CallerDetails>, StoreError> {
        Ok(self.state.lock().await.details.get(code).cloned())
    }

    async fn count_children(&self, code: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        let messages = state.messages.get(code).map(Vec::len).unwrap_or(0);
        let details = usize::from(state.details.contains_key(code));
        Ok(messages + details)
    }

    async fn delete_children_batch(&self, code: &str, batch: usize) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let batch = batch.max(1);

        if let Some(messages) = state.messages.get_mut(code) {
            let n = batch.min(messages.len());
            messages.drain(..n);
            if messages.is_empty() {
                state.messages.remove(code);
            }
            if n > 0 {
                return Ok(n);
            }
        }

        Ok(usize::from(state.details.remove(code).is_some()))
    }

    async fn delete_session(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.sessions.remove(code).is_some())
    }

    async fn expired_codes(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.codes_by(now, limit, |s| s.expires_at))
    }

    async fn closed_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.codes_by(cutoff, limit, |s| {
            if s.closed {
                s.closed_at
            } else {
                None
            }
        }))
    }

    async fn created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.codes_by(cutoff, limit, |s| s.created_at))
    }

    async fn untimestamped_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.codes_by(cutoff, limit, |s| {
            if s.created_at.is_none() && s.expires_at.is_none() {
                Some(s.inserted_at)
            } else {
                None
            }
        }))
    }

    async fn entitlement_for_email(&self, email: &str) -> Result<Option<OrgEntitlement>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.entitlements.get(&email.to_lowercase()).cloned())
    }

    async fn enqueue_backfill(&self, record: &MeterBackfill) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state
            .backfills
            .iter()
            .any(|b| b.identifier == record.identifier)
        {
            state.backfills.push(record.clone());
        }
        Ok(())
    }

    async fn due_backfills(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MeterBackfill>, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<MeterBackfill> = state
            .backfills
            .iter()
            .filter(|b| b.status == BackfillStatus::Pending && b.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|b| b.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update_backfill(&self, record: &MeterBackfill) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.backfills.iter_mut().find(|b| b.id == record.id) {
            *existing = record.clone();
        }
        Ok(())
    }

    async fn pending_backfill_count(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .backfills
            .iter()
            .filter(|b| b.status == BackfillStatus::Pending)
            .count() as i64)
    }

    async fn record_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        self.state.lock().await.job_runs.push(run.clone());
        Ok(())
    }

    async fn last_job_run(&self, job: JobKind) -> Result<Option<JobRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .job_runs
            .iter()
            .filter(|r| r.job == job.as_str())
            .max_by_key(|r| r.finished_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobTrigger, Sender};
    use chrono::Duration;
    use std::sync::Arc;

    fn session(code: &str, now: DateTime<Utc>) -> Session {
        Session::new(code, now, Duration::hours(1), None, None)
    }

    #[tokio::test]
    async fn test_concurrent_joins_admit_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store.insert_session(&session("482931", now)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.join_session("482931", None, now).await
            }));
        }

        let mut ok = 0;
        let mut already = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StoreError::Rejected(SessionRejection::AlreadyJoined)) => already += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(already, 15);
    }

    #[tokio::test]
    async fn test_join_missing_session_is_not_found() {
        let store = MemoryStore::new();
        let result = store.join_session("111111", None, Utc::now()).await;
        assert!(matches!(
            result,
            Err(StoreError::Rejected(SessionRejection::NotFound))
        ));
    }

    #[tokio::test]
    async fn test_join_stores_caller_details() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_session(&session("123456", now)).await.unwrap();
        let details = CallerDetails {
            name: Some("Ana".into()),
            email: Some("ana@example.com".into()),
            ..Default::default()
        };
        store.join_session("123456", Some(&details), now).await.unwrap();

        let stored = store.get_details("123456").await.unwrap().unwrap();
        assert_eq!(stored.session_code, "123456");
        assert_eq!(stored.email.as_deref(), Some("ana@example.com"));
    }

    #[tokio::test]
    async fn test_candidate_queries_are_oldest_first_and_capped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (i, code) in ["100001", "100002", "100003"].iter().enumerate() {
            let mut s = session(code, now);
            s.expires_at = Some(now - Duration::minutes(10 - i as i64));
            store.insert_session(&s).await.unwrap();
        }
        store.insert_session(&session("100004", now)).await.unwrap();

        let codes = store.expired_codes(now, 2).await.unwrap();
        assert_eq!(codes, vec!["100001", "100002"]);
    }

    #[tokio::test]
    async fn test_delete_children_batches_then_details() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            let m = ChatMessage::translated("200001", Sender::Agent, "hi", "hola", "es", now);
            store.append_message(&m).await.unwrap();
        }
        store
            .put_details(CallerDetails {
                session_code: "200001".into(),
                name: Some("x".into()),
                ..Default::default()
            })
            .await;

        assert_eq!(store.count_children("200001").await.unwrap(), 4);
        assert_eq!(store.delete_children_batch("200001", 2).await.unwrap(), 2);
        assert_eq!(store.delete_children_batch("200001", 2).await.unwrap(), 1);
        assert_eq!(store.delete_children_batch("200001", 2).await.unwrap(), 1);
        assert_eq!(store.delete_children_batch("200001", 2).await.unwrap(), 0);
        assert_eq!(store.count_children("200001").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backfill_enqueue_is_idempotent_by_identifier() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rec = crate::models::NewBackfill {
            session_code: "300001".into(),
            email: None,
            customer_id: None,
            event_name: "translate_commit".into(),
            value: 1,
            identifier: "msg-1".into(),
            reason: "no_email".into(),
        }
        .into_record(now);

        store.enqueue_backfill(&rec).await.unwrap();
        let mut dup = rec.clone();
        dup.id = uuid::Uuid::new_v4();
        store.enqueue_backfill(&dup).await.unwrap();

        assert_eq!(store.pending_backfill_count().await.unwrap(), 1);
        assert_eq!(store.due_backfills(now, 10).await.unwrap().len(), 1);
        assert!(store
            .due_backfills(now - Duration::seconds(1), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_last_job_run_picks_latest() {
        let store = MemoryStore::new();
        let started = Utc::now();
        let mut first = JobRun::new(JobKind::Cleanup, JobTrigger::Cron, started, serde_json::json!({"n": 1}));
        first.finished_at = started;
        let mut second = JobRun::new(JobKind::Cleanup, JobTrigger::Staff, started, serde_json::json!({"n": 2}));
        second.finished_at = started + Duration::seconds(5);
        store.record_job_run(&second).await.unwrap();
        store.record_job_run(&first).await.unwrap();

        let last = store.last_job_run(JobKind::Cleanup).await.unwrap().unwrap();
        assert_eq!(last.summary["n"], 2);
        assert!(store.last_job_run(JobKind::MeterBackfill).await.unwrap().is_none());
    }
}
