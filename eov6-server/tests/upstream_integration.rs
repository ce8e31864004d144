//! Translate route against mocked translation and billing APIs
//!
//! Uses the real HTTP clients pointed at wiremock servers, so the request
//! shapes and error mapping are covered end to end.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use eov6_core::config::{BillingConfig, TranslateConfig};
use eov6_core::models::Session;
use eov6_core::{Eov6Config, GoogleTranslateClient, MemoryStore, SessionStore, StripeMeterClient, UnavailableIdentity};
use eov6_server::http::build_router;
use eov6_server::AppContext;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Upstreams {
    app: Router,
    store: Arc<MemoryStore>,
    google: MockServer,
    stripe: MockServer,
}

async fn upstreams() -> Upstreams {
    let google = MockServer::start().await;
    let stripe = MockServer::start().await;

    let translate_cfg = TranslateConfig {
        api_key: "g-key".to_string(),
        max_retries: 0,
        retry_delay_ms: 1,
        ..TranslateConfig::default()
    };
    let billing_cfg = BillingConfig {
        stripe_secret_key: "sk_test".to_string(),
        max_retries: 0,
        retry_delay_ms: 1,
        ..BillingConfig::default()
    };

    let translator = GoogleTranslateClient::with_base_url(translate_cfg, google.uri()).unwrap();
    let meter = StripeMeterClient::with_base_url(billing_cfg, stripe.uri()).unwrap();

    let store = Arc::new(MemoryStore::new());
    let mut ctx = AppContext::in_memory(
        Eov6Config::default(),
        Arc::new(translator),
        Arc::new(meter),
        Arc::new(UnavailableIdentity::new("not configured")),
    );
    ctx.store = store.clone();

    let now = Utc::now();
    store
        .insert_session(&Session::new("482931", now, Duration::hours(1), None, None))
        .await
        .unwrap();

    Upstreams {
        app: build_router(Arc::new(ctx)),
        store,
        google,
        stripe,
    }
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn google_ok(text: &str) -> Value {
    json!({
        "data": { "translations": [{ "translatedText": text, "detectedSourceLanguage": "en" }] }
    })
}

#[tokio::test]
async fn test_preview_returns_backend_translation() {
    let u = upstreams().await;
    Mock::given(method("POST"))
        .and(query_param("key", "g-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(google_ok("hola")))
        .expect(1)
        .mount(&u.google)
        .await;

    let (status, body) = post(
        &u.app,
        "/api/translate",
        json!({ "code": "482931", "text": "hello", "target": "es" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", body);
    assert_eq!(body["translated"], "hola");
    assert_eq!(body["detectedSource"], "en");
    assert_eq!(body["usage"]["previewCount"], 1);
}

#[tokio::test]
async fn test_backend_error_maps_to_bad_gateway() {
    let u = upstreams().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "Invalid Value" }
        })))
        .mount(&u.google)
        .await;

    let (status, body) = post(
        &u.app,
        "/api/translate",
        json!({ "code": "482931", "text": "hello", "target": "zz" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_unavailable");
}

#[tokio::test]
async fn test_commit_meters_with_message_identifier() {
    let u = upstreams().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(google_ok("hola")))
        .mount(&u.google)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .and(query_param("email", "ana@example.com"))
        .and(header("authorization", "Bearer sk_test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": "cus_123" }] })))
        .expect(1)
        .mount(&u.stripe)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/meter_events"))
        .and(body_string_contains("cus_123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "object": "billing.meter_event" })))
        .expect(1)
        .mount(&u.stripe)
        .await;

    let (status, _) = post(
        &u.app,
        "/api/sessions/join",
        json!({ "code": "482931", "name": "Ana", "email": "ana@example.com" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &u.app,
        "/api/translate",
        json!({ "code": "482931", "text": "hello", "target": "es", "mode": "commit" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", body);
    assert_eq!(body["metered"], true);

    let requests = u.stripe.received_requests().await.unwrap();
    let event = requests
        .iter()
        .find(|r| r.url.path() == "/v1/billing/meter_events")
        .unwrap();
    let form = String::from_utf8_lossy(&event.body);
    assert!(form.contains(&format!("identifier={}", body["messageId"].as_str().unwrap())));
    assert_eq!(u.store.pending_backfill_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_billing_outage_queues_backfill() {
    let u = upstreams().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(google_ok("hola")))
        .mount(&u.google)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "id": "cus_123" }] })))
        .mount(&u.stripe)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/billing/meter_events"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": { "message": "boom" } })))
        .mount(&u.stripe)
        .await;

    post(
        &u.app,
        "/api/sessions/join",
        json!({ "code": "482931", "email": "ana@example.com" }),
    )
    .await;
    let (status, body) = post(
        &u.app,
        "/api/translate",
        json!({ "code": "482931", "text": "hello", "target": "es", "mode": "commit" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metered"], false);
    assert_eq!(u.store.pending_backfill_count().await.unwrap(), 1);
}
