//! HTTP integration tests for the EOV6 API
//!
//! Full router dispatch through `oneshot` against the in-memory store and
//! blob backend, with counting fakes for translation, metering and identity.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use eov6_core::models::{BackfillStatus, ChatMessage, Sender, Session};
use eov6_core::{
    Eov6Config, Identity, IdentityError, IdentityVerifier, MemoryStore, MeterBackend, MeterError, SessionStore,
    TranslateError, Translation, Translator, UsageEvent,
};
use eov6_server::http::build_router;
use eov6_server::AppContext;
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "integration-cron-secret";

// ===========================================================================
// Fakes
// ===========================================================================

#[derive(Default)]
struct CountingTranslator {
    calls: AtomicUsize,
}

#[async_trait]
impl Translator for CountingTranslator {
    async fn translate(&self, text: &str, target: &str, _source: Option<&str>) -> Result<Translation, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Translation {
            text: format!("{}:{}", target, text),
            detected_source: None,
        })
    }

    fn name(&self) -> &str {
        "counting"
    }
}

#[derive(Default)]
struct SwitchableMeter {
    down: AtomicBool,
    events: AtomicUsize,
}

#[async_trait]
impl MeterBackend for SwitchableMeter {
    async fn find_customer(&self, email: &str) -> Result<Option<String>, MeterError> {
        Ok(Some(format!("cus_{}", email.len())))
    }

    async fn record_usage(&self, _event: &UsageEvent) -> Result<(), MeterError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(MeterError::Api {
                status: 503,
                message: "meter offline".into(),
            });
        }
        self.events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "switchable"
    }
}

struct TokenTable;

#[async_trait]
impl IdentityVerifier for TokenTable {
    async fn verify(&self, id_token: &str) -> Result<Identity, IdentityError> {
        let email = match id_token {
            "agent-token" => "agent@example.com",
            "staff-token" => "ops@example.com",
            _ => return Err(IdentityError::InvalidToken),
        };
        Ok(Identity {
            uid: format!("uid-{}", id_token),
            email: Some(email.to_string()),
        })
    }

    fn name(&self) -> &str {
        "table"
    }
}

struct Harness {
    app: Router,
    ctx: Arc<AppContext>,
    store: Arc<MemoryStore>,
    translator: Arc<CountingTranslator>,
    meter: Arc<SwitchableMeter>,
}

fn harness() -> Harness {
    let mut config = Eov6Config::default();
    config.auth.cron_secret = SECRET.to_string();
    config.auth.staff_emails = vec!["ops@example.com".to_string()];
    config.translate.free_previews = 3;

    let translator = Arc::new(CountingTranslator::default());
    let meter = Arc::new(SwitchableMeter::default());
    let store = Arc::new(MemoryStore::new());

    let mut ctx = AppContext::in_memory(config, translator.clone(), meter.clone(), Arc::new(TokenTable));
    ctx.store = store.clone();
    let ctx = Arc::new(ctx);

    Harness {
        app: build_router(ctx.clone()),
        ctx,
        store,
        translator,
        meter,
    }
}

impl Harness {
    async fn seed(&self, code: &str, created_ago: Duration, ttl: Duration) {
        let now = Utc::now();
        self.ctx
            .store
            .insert_session(&Session::new(code, now - created_ago, ttl, None, None))
            .await
            .unwrap();
    }

    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        send(self.app.clone(), req).await
    }
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn get_with(uri: &str, header: &str, value: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header, value)
        .body(Body::empty())
        .unwrap()
}

// ===========================================================================
// Sessions
// ===========================================================================

#[tokio::test]
async fn test_version_endpoint() {
    let h = harness();
    let (status, body) = h.call(get("/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "eov6/1");
}

#[tokio::test]
async fn test_create_then_view_session() {
    let h = harness();

    let req = Request::builder()
        .method("POST")
        .uri("/api/sessions/create")
        .header("authorization", "Bearer agent-token")
        .body(Body::empty())
        .unwrap();
    let (status, body) = h.call(req).await;
    assert_eq!(status, StatusCode::CREATED, "{:?}", body);
    let code = body["code"].as_str().unwrap().to_string();
    assert_eq!(code.len(), 6);
    assert!(body["expiresAt"].is_string());

    let (status, view) = h.call(get(&format!("/api/sessions/{}", code))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "open");
    assert_eq!(view["joined"], false);
    assert!(view.get("agentEmail").is_none());
}

#[tokio::test]
async fn test_create_rejects_bad_token() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/api/sessions/create")
        .header("authorization", "Bearer forged")
        .body(Body::empty())
        .unwrap();
    let (status, body) = h.call(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "unauthorized" }));
}

#[tokio::test]
async fn test_two_simultaneous_joins_one_wins() {
    let h = harness();
    h.seed("482931", Duration::zero(), Duration::hours(1)).await;

    let a = send(h.app.clone(), post_json("/api/sessions/join", json!({ "code": "482931" })));
    let b = send(h.app.clone(), post_json("/api/sessions/join", json!({ "code": "482931" })));
    let ((sa, ba), (sb, bb)) = tokio::join!(a, b);

    let mut statuses = vec![sa.as_u16(), sb.as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 409]);

    let (ok, conflict) = if sa == StatusCode::OK { (ba, bb) } else { (bb, ba) };
    assert_eq!(ok["ok"], true);
    assert_eq!(conflict, json!({ "error": "already_joined" }));
}

#[tokio::test]
async fn test_many_concurrent_joins_exactly_one_succeeds() {
    let h = harness();
    h.seed("100200", Duration::zero(), Duration::hours(1)).await;

    let attempts = (0..16).map(|_| {
        let app = h.app.clone();
        tokio::spawn(async move { send(app, post_json("/api/sessions/join", json!({ "code": "100200" }))).await })
    });
    let results = futures::future::join_all(attempts).await;

    let winners = results
        .iter()
        .filter(|r| r.as_ref().unwrap().0 == StatusCode::OK)
        .count();
    assert_eq!(winners, 1);
    for r in &results {
        let (status, body) = r.as_ref().unwrap();
        if *status != StatusCode::OK {
            assert_eq!(*status, StatusCode::CONFLICT);
            assert_eq!(body["error"], "already_joined");
        }
    }
}

#[tokio::test]
async fn test_join_rejections() {
    let h = harness();
    h.seed("111111", Duration::hours(2), Duration::hours(1)).await;
    h.seed("222222", Duration::zero(), Duration::hours(1)).await;
    h.ctx.store.close_session("222222", Utc::now()).await.unwrap();

    let (status, body) = h.call(post_json("/api/sessions/join", json!({ "code": "111111" }))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "expired");

    let (status, body) = h.call(post_json("/api/sessions/join", json!({ "code": "222222" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "closed");

    let (status, body) = h.call(post_json("/api/sessions/join", json!({ "code": "999999" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = h.call(post_json("/api/sessions/join", json!({ "code": "dddddd" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_code");

    let bad_json = Request::builder()
        .method("POST")
        .uri("/api/sessions/join")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = h.call(bad_json).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_body");
}

#[tokio::test]
async fn test_expired_join_is_always_gone() {
    let h = harness();
    // expires exactly one second ago
    h.seed("333333", Duration::hours(1) + Duration::seconds(1), Duration::hours(1)).await;
    for _ in 0..3 {
        let (status, _) = h.call(post_json("/api/sessions/join", json!({ "code": "333333" }))).await;
        assert_eq!(status, StatusCode::GONE);
    }
}

#[tokio::test]
async fn test_upload_and_end_session() {
    let h = harness();
    h.seed("444444", Duration::zero(), Duration::hours(1)).await;

    let upload = Request::builder()
        .method("PUT")
        .uri("/api/sessions/444444/uploads/id-card.png")
        .body(Body::from(vec![1u8, 2, 3]))
        .unwrap();
    let (status, body) = h.call(upload).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["key"], "uploads/444444/id-card.png");
    assert_eq!(body["size"], 3);

    let (status, body) = h.call(post_json("/api/session/end", json!({ "code": "444444" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["blobsDeleted"], 1);
    assert!(h.ctx.blobs.list("uploads/444444/").await.unwrap().is_empty());

    let (_, view) = h.call(get("/api/sessions/444444")).await;
    assert_eq!(view["status"], "closed");

    let (status, _) = h.call(post_json("/api/session/end", json!({ "code": "555555" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ===========================================================================
// Translation
// ===========================================================================

#[tokio::test]
async fn test_preview_limit_never_calls_backend() {
    let h = harness();
    h.seed("482931", Duration::zero(), Duration::hours(1)).await;
    let preview = || {
        post_json(
            "/api/translate",
            json!({ "code": "482931", "text": "hola", "target": "en", "mode": "preview" }),
        )
    };

    for expected in 1..=3 {
        let (status, body) = h.call(preview()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["usage"]["previewCount"], expected);
    }

    for _ in 0..4 {
        let (status, body) = h.call(preview()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "preview_limit_reached");
    }
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_translate_on_expired_session() {
    let h = harness();
    h.seed("482931", Duration::hours(2), Duration::hours(1)).await;
    let (status, body) = h
        .call(post_json(
            "/api/translate",
            json!({ "code": "482931", "text": "hola", "target": "en", "mode": "commit" }),
        ))
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"], "expired");
    assert_eq!(h.translator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_commit_stores_message_and_meters() {
    let h = harness();
    h.seed("482931", Duration::zero(), Duration::hours(1)).await;
    h.call(post_json(
        "/api/sessions/join",
        json!({ "code": "482931", "name": "Ana", "email": "ana@example.com" }),
    ))
    .await;

    let (status, body) = h
        .call(post_json(
            "/api/translate",
            json!({ "code": "482931", "text": "hola", "target": "en", "mode": "commit", "sender": "caller" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["translated"], "en:hola");
    assert_eq!(body["metered"], true);
    assert_eq!(h.meter.events.load(Ordering::SeqCst), 1);

    let (status, transcript) = h.call(get("/api/sessions/482931/messages")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(transcript["messages"][0]["id"], body["messageId"]);
    assert_eq!(transcript["messages"][0]["translatedText"], "en:hola");
}

// ===========================================================================
// Backfill
// ===========================================================================

#[tokio::test]
async fn test_failed_meter_call_is_reconciled() {
    let h = harness();
    h.seed("482931", Duration::zero(), Duration::hours(1)).await;
    h.call(post_json(
        "/api/sessions/join",
        json!({ "code": "482931", "email": "ana@example.com" }),
    ))
    .await;

    h.meter.down.store(true, Ordering::SeqCst);
    let (status, body) = h
        .call(post_json(
            "/api/translate",
            json!({ "code": "482931", "text": "hola", "target": "en", "mode": "commit" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "metering failure must not fail the request");
    assert_eq!(body["metered"], false);

    let queued = h.store.backfills().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].reason, "meter_failed");
    assert_eq!(queued[0].identifier, body["messageId"].as_str().unwrap());

    h.meter.down.store(false, Ordering::SeqCst);
    let (status, report) = h
        .call(get_with("/api/jobs/meter-backfill", "x-cron-secret", SECRET))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["recorded"], 1);
    assert_eq!(h.store.backfills().await[0].status, BackfillStatus::Done);
    assert_eq!(h.meter.events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_failures_back_off_then_fail() {
    let h = harness();
    h.seed("482931", Duration::zero(), Duration::hours(1)).await;
    h.meter.down.store(true, Ordering::SeqCst);
    h.call(post_json(
        "/api/translate",
        json!({ "code": "482931", "text": "hola", "target": "en", "mode": "commit" }),
    ))
    .await;

    let max = h.ctx.config.billing.backfill_max_attempts;
    let mut now = Utc::now();
    for attempt in 1..=max {
        let report = eov6_server::subsystems::backfill::run_backfill_tick(&h.ctx, now)
            .await
            .unwrap();
        assert_eq!(report.scanned, 1, "attempt {}", attempt);
        let rec = h.store.backfills().await.remove(0);
        assert_eq!(rec.attempts, attempt);
        if attempt < max {
            assert_eq!(rec.status, BackfillStatus::Pending);
            assert!(rec.next_attempt_at > now);
            now = rec.next_attempt_at;
        } else {
            assert_eq!(rec.status, BackfillStatus::Failed);
        }
    }
}

// ===========================================================================
// Cleanup job
// ===========================================================================

#[tokio::test]
async fn test_cleanup_purges_expired_scenario() {
    let h = harness();
    let now = Utc::now();
    h.ctx
        .store
        .insert_session(&Session::new(
            "482931",
            now - Duration::hours(1) - Duration::seconds(1),
            Duration::hours(1),
            None,
            None,
        ))
        .await
        .unwrap();
    for text in ["hola", "adios"] {
        let msg = ChatMessage::translated("482931", Sender::Caller, text, text, "en", now);
        h.ctx.store.append_message(&msg).await.unwrap();
    }
    h.ctx.blobs.put("uploads/482931/a.png", b"a").await.unwrap();
    h.ctx.blobs.put("uploads/482931/b/c.pdf", b"c").await.unwrap();

    let (status, report) = h
        .call(get(&format!("/api/jobs/cleanup?mode=expired&secret={}", SECRET)))
        .await;
    assert_eq!(status, StatusCode::OK, "{:?}", report);
    assert_eq!(report["candidateCodes"], json!(["482931"]));
    assert_eq!(report["sessionsDeleted"], 1);
    assert_eq!(report["childDocsDeleted"], 2);
    assert_eq!(report["blobsDeleted"], 2);

    let (status, body) = h.call(get("/api/sessions/482931")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    assert!(h.ctx.blobs.list("uploads/482931/").await.unwrap().is_empty());
    assert_eq!(h.ctx.store.count_children("482931").await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let h = harness();
    h.seed("111111", Duration::hours(3), Duration::hours(1)).await;
    h.seed("222222", Duration::hours(48), Duration::hours(100)).await;
    h.seed("333333", Duration::zero(), Duration::hours(1)).await;

    let (_, first) = h.call(get_with("/api/jobs/cleanup", "x-cron-secret", SECRET)).await;
    assert_eq!(first["sessionsDeleted"], 2);

    let (status, second) = h.call(get_with("/api/jobs/cleanup", "x-cron-secret", SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["candidates"], 0);
    assert_eq!(second["sessionsDeleted"], 0);
    assert_eq!(second["blobsDeleted"], 0);

    assert!(h.ctx.store.get_session("333333").await.unwrap().is_some());
}

#[tokio::test]
async fn test_job_authorization() {
    let h = harness();

    let (status, body) = h.call(get("/api/jobs/cleanup")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = h.call(get_with("/api/jobs/cleanup", "x-cron-secret", "wrong")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h.call(get("/api/jobs/cleanup?secret=wrong")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = h
        .call(get_with("/api/jobs/cleanup", "authorization", "Bearer agent-token"))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "non-staff accounts are refused");

    let (status, _) = h
        .call(get_with("/api/jobs/cleanup", "authorization", "Bearer forged"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = h
        .call(get_with("/api/jobs/cleanup", "authorization", "Bearer staff-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trigger"], "staff");

    let bearer_secret = format!("Bearer {}", SECRET);
    let (status, body) = h
        .call(get_with("/api/jobs/cleanup", "authorization", &bearer_secret))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trigger"], "cron");
}

#[tokio::test]
async fn test_job_status_after_runs() {
    let h = harness();
    h.call(get_with("/api/jobs/cleanup", "x-cron-secret", SECRET)).await;
    h.call(get_with("/api/jobs/meter-backfill", "x-cron-secret", SECRET)).await;

    let (status, body) = h
        .call(get_with("/api/jobs/status", "authorization", "Bearer staff-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"]["cleanup"]["trigger"], "cron");
    assert_eq!(body["jobs"]["meterBackfill"]["trigger"], "cron");
    assert_eq!(body["pendingBackfills"], 0);
}
