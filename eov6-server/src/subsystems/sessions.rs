//! Session lifecycle: allocate, join, inspect, end, uploads
//!
//! A session moves `open → joined → closed`, with expiry able to cut any
//! state short. The join transition is decided inside the store so that
//! concurrent callers race on one record lock, never on a stale read.

use chrono::{DateTime, Duration, Utc};
use eov6_core::blob::session_prefix;
use eov6_core::models::{generate_code, is_valid_code, CallerDetails, ChatMessage, Session, SessionRejection};
use eov6_core::Identity;
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::ApiError;
use crate::subsystems::cleanup::purge_children;

pub const DEFAULT_MESSAGE_LIMIT: usize = 100;
pub const MAX_MESSAGE_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub code: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl JoinRequest {
    fn details(&self, code: &str, now: DateTime<Utc>) -> CallerDetails {
        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        CallerDetails {
            session_code: code.to_string(),
            name: clean(&self.name),
            email: clean(&self.email),
            phone: clean(&self.phone),
            extra: serde_json::json!({}),
            updated_at: now,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EndRequest {
    pub code: Option<String>,
}

/// Public view of a session. Never exposes agent or org identity.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub code: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub joined: bool,
    pub closed: bool,
}

impl SessionView {
    pub fn of(session: &Session, now: DateTime<Utc>) -> Self {
        let status = if !session.is_closed() && session.is_expired(now) {
            "expired".to_string()
        } else {
            session.status.to_string()
        };
        Self {
            code: session.code.clone(),
            status,
            expires_at: session.expires_at,
            joined: session.caller_joined_at.is_some(),
            closed: session.is_closed(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndOutcome {
    pub code: String,
    pub closed_at: Option<DateTime<Utc>>,
    pub child_docs_deleted: usize,
    pub blobs_deleted: usize,
}

/// Trim and validate a session code taken from a request.
pub fn parse_code(raw: Option<&str>) -> Result<String, ApiError> {
    let code = raw.map(str::trim).unwrap_or_default();
    if !is_valid_code(code) {
        return Err(ApiError::BadRequest("invalid_code"));
    }
    Ok(code.to_string())
}

/// Allocate a fresh code for an authenticated agent.
///
/// The agent's org is taken from an active entitlement, if any. Code
/// collisions are retried up to `sessions.code_attempts` times.
pub async fn create_session(
    ctx: &AppContext,
    agent: &Identity,
    now: DateTime<Utc>,
) -> Result<Session, ApiError> {
    let org_id = match agent.email.as_deref() {
        Some(email) => ctx
            .store
            .entitlement_for_email(email)
            .await?
            .filter(|e| e.is_active())
            .and_then(|e| e.org_id),
        None => None,
    };

    let ttl = Duration::minutes(ctx.config.sessions.ttl_minutes);
    let attempts = ctx.config.sessions.code_attempts.max(1);

    for attempt in 1..=attempts {
        let code = generate_code().map_err(|e| ApiError::Internal(format!("code generation: {}", e)))?;
        let session = Session::new(code, now, ttl, agent.email.clone(), org_id.clone());
        if ctx.store.insert_session(&session).await? {
            tracing::info!(
                code = %session.code,
                agent = ?agent.email,
                org = ?session.org_id,
                attempt,
                "Session created"
            );
            return Ok(session);
        }
        tracing::debug!(code = %session.code, attempt, "Session code collision");
    }

    Err(ApiError::Internal(format!(
        "no free session code after {} attempts",
        attempts
    )))
}

/// Mark the session joined. Exactly one caller wins per session.
pub async fn join_session(
    ctx: &AppContext,
    req: &JoinRequest,
    now: DateTime<Utc>,
) -> Result<Session, ApiError> {
    let code = parse_code(req.code.as_deref())?;
    let details = req.details(&code, now);
    let details = (!details.is_empty()).then_some(details);

    match ctx.store.join_session(&code, details.as_ref(), now).await {
        Ok(session) => {
            tracing::info!(code = %code, with_details = details.is_some(), "Caller joined session");
            Ok(session)
        }
        Err(e) => {
            let e = ApiError::from(e);
            if let ApiError::Session(reason) = &e {
                tracing::info!(code = %code, reason = reason.code(), "Join refused");
            }
            Err(e)
        }
    }
}

pub async fn get_session(ctx: &AppContext, code: &str, now: DateTime<Utc>) -> Result<SessionView, ApiError> {
    let code = parse_code(Some(code))?;
    let session = ctx
        .store
        .get_session(&code)
        .await?
        .ok_or(SessionRejection::NotFound)?;
    Ok(SessionView::of(&session, now))
}

/// Transcript of an active session, oldest first.
pub async fn list_messages(
    ctx: &AppContext,
    code: &str,
    limit: Option<usize>,
    now: DateTime<Utc>,
) -> Result<Vec<ChatMessage>, ApiError> {
    let session = active_session(ctx, code, now).await?;
    let limit = limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).clamp(1, MAX_MESSAGE_LIMIT);
    Ok(ctx.store.list_messages(&session.code, limit).await?)
}

/// Close the session and wipe its children and uploads. The closed record
/// stays behind for the cleanup job.
pub async fn end_session(ctx: &AppContext, req: &EndRequest, now: DateTime<Utc>) -> Result<EndOutcome, ApiError> {
    let code = parse_code(req.code.as_deref())?;
    let closed = ctx.store.close_session(&code, now).await?;

    let children = purge_children(ctx, &code).await?;
    let blobs = ctx.blobs.delete_prefix(&session_prefix(&code)).await?;

    tracing::info!(code = %code, children, blobs, "Session ended");
    Ok(EndOutcome {
        code,
        closed_at: closed.closed_at,
        child_docs_deleted: children,
        blobs_deleted: blobs,
    })
}

/// Store one upload under the session's blob prefix. Returns the object key.
pub async fn store_upload(
    ctx: &AppContext,
    code: &str,
    name: &str,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<String, ApiError> {
    if !is_valid_upload_name(name) {
        return Err(ApiError::BadRequest("invalid_upload_name"));
    }
    let session = active_session(ctx, code, now).await?;

    let key = format!("{}{}", session_prefix(&session.code), name);
    ctx.blobs.put(&key, bytes).await?;
    tracing::debug!(key = %key, size = bytes.len(), "Upload stored");
    Ok(key)
}

fn is_valid_upload_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(char::is_control)
}

/// Load `code` and require it to be open or joined and unexpired.
pub(crate) async fn active_session(ctx: &AppContext, code: &str, now: DateTime<Utc>) -> Result<Session, ApiError> {
    let code = parse_code(Some(code))?;
    let session = ctx
        .store
        .get_session(&code)
        .await?
        .ok_or(SessionRejection::NotFound)?;
    session.check_active(now)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use eov6_core::models::OrgEntitlement;
    use eov6_core::{Eov6Config, MemoryStore, SessionStore, UnavailableIdentity, UnavailableMeter, UnavailableTranslator};

    fn ctx_with(store: Arc<MemoryStore>) -> AppContext {
        let mut ctx = AppContext::in_memory(
            Eov6Config::default(),
            Arc::new(UnavailableTranslator::new("test")),
            Arc::new(UnavailableMeter::new("test")),
            Arc::new(UnavailableIdentity::new("test")),
        );
        ctx.store = store;
        ctx
    }

    fn agent(email: &str) -> Identity {
        Identity {
            uid: "agent-uid".into(),
            email: Some(email.into()),
        }
    }

    #[test]
    fn test_parse_code_rejects_malformed() {
        assert!(parse_code(Some("482931")).is_ok());
        assert_eq!(parse_code(Some(" 482931 ")).unwrap(), "482931");
        for bad in ["48293", "4829310", "dddddd", "48a931", ""] {
            assert!(matches!(parse_code(Some(bad)), Err(ApiError::BadRequest("invalid_code"))));
        }
        assert!(parse_code(None).is_err());
    }

    #[test]
    fn test_upload_names() {
        assert!(is_valid_upload_name("photo.jpg"));
        assert!(!is_valid_upload_name("../etc"));
        assert!(!is_valid_upload_name("a/b"));
        assert!(!is_valid_upload_name(".."));
        assert!(!is_valid_upload_name(""));
    }

    #[test]
    fn test_view_reports_expired() {
        let now = Utc::now();
        let s = Session::new("482931", now - Duration::hours(2), Duration::hours(1), None, None);
        let view = SessionView::of(&s, now);
        assert_eq!(view.status, "expired");
        assert!(!view.joined);
    }

    #[tokio::test]
    async fn test_create_resolves_org_from_active_entitlement() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_entitlement(OrgEntitlement {
                email: "agent@example.com".into(),
                org_id: Some("org-7".into()),
                plan: "team".into(),
                status: "active".into(),
                stripe_customer_id: None,
                updated_at: Utc::now(),
            })
            .await;
        let ctx = ctx_with(store);
        let now = Utc::now();

        let session = create_session(&ctx, &agent("agent@example.com"), now).await.unwrap();
        assert!(is_valid_code(&session.code));
        assert_eq!(session.org_id.as_deref(), Some("org-7"));
        assert_eq!(session.expires_at, Some(now + Duration::minutes(60)));

        let stored = ctx.store.get_session(&session.code).await.unwrap().unwrap();
        assert_eq!(stored.agent_email.as_deref(), Some("agent@example.com"));
    }

    #[tokio::test]
    async fn test_join_stores_details_and_rejects_second_join() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        ctx.store
            .insert_session(&Session::new("482931", now, Duration::hours(1), None, None))
            .await
            .unwrap();

        let req = JoinRequest {
            code: Some("482931".into()),
            name: Some(" Ana ".into()),
            email: Some("ana@example.com".into()),
            phone: None,
        };
        let joined = join_session(&ctx, &req, now).await.unwrap();
        assert!(joined.caller_joined_at.is_some());

        let details = ctx.store.get_details("482931").await.unwrap().unwrap();
        assert_eq!(details.name.as_deref(), Some("Ana"));

        let again = join_session(&ctx, &req, now).await;
        assert!(matches!(again, Err(ApiError::Session(SessionRejection::AlreadyJoined))));
    }

    #[tokio::test]
    async fn test_end_wipes_children_and_blobs_but_keeps_record() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        ctx.store
            .insert_session(&Session::new("100200", now, Duration::hours(1), None, None))
            .await
            .unwrap();
        store_upload(&ctx, "100200", "id.png", b"png", now).await.unwrap();
        ctx.store
            .append_message(&ChatMessage::translated("100200", Default::default(), "hola", "hello", "en", now))
            .await
            .unwrap();

        let out = end_session(&ctx, &EndRequest { code: Some("100200".into()) }, now).await.unwrap();
        assert_eq!(out.child_docs_deleted, 1);
        assert_eq!(out.blobs_deleted, 1);

        let record = ctx.store.get_session("100200").await.unwrap().unwrap();
        assert!(record.is_closed());

        // second end is a no-op apart from keeping the first close time
        let again = end_session(&ctx, &EndRequest { code: Some("100200".into()) }, now + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(again.closed_at, out.closed_at);
        assert_eq!(again.child_docs_deleted, 0);
    }

    #[tokio::test]
    async fn test_upload_refused_for_closed_session() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        ctx.store
            .insert_session(&Session::new("300400", now, Duration::hours(1), None, None))
            .await
            .unwrap();
        ctx.store.close_session("300400", now).await.unwrap();

        let res = store_upload(&ctx, "300400", "doc.pdf", b"x", now).await;
        assert!(matches!(res, Err(ApiError::Session(SessionRejection::Closed))));
    }
}
