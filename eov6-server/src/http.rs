//! EOV6 HTTP API
//!
//! Axum server for the session lifecycle, the translation gateway and the
//! maintenance jobs.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to an
//! inner function returning `(StatusCode, Value)`. The inner functions are
//! directly testable without axum dispatch machinery.
//!
//! Endpoints:
//! - GET  /health                             : store health
//! - GET  /version                            : server version info
//! - POST /api/sessions/create                : allocate a session code (agent bearer)
//! - POST /api/sessions/join                  : caller joins a session
//! - GET  /api/sessions/:code                 : public session view
//! - GET  /api/sessions/:code/messages        : chat transcript
//! - PUT  /api/sessions/:code/uploads/:name   : store a session upload
//! - POST /api/translate                      : preview/commit translation
//! - POST /api/session/end                    : caller-initiated teardown
//! - GET  /api/jobs/cleanup                   : purge sessions (cron secret or staff)
//! - GET  /api/jobs/meter-backfill            : drain the backfill queue
//! - GET  /api/jobs/status                    : last job runs

use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use eov6_core::models::JobKind;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::auth::{authenticate_agent, authorize_job, JobCaller};
use crate::context::AppContext;
use crate::error::ApiError;
use crate::subsystems::backfill::run_backfill_job;
use crate::subsystems::cleanup::{run_cleanup, CleanupOptions, CleanupQuery};
use crate::subsystems::sessions::{self, EndRequest, JoinRequest};
use crate::subsystems::translate::{self, TranslateMode, TranslateRequest};

pub type Reply = (StatusCode, serde_json::Value);

/// Build the Axum router with all endpoints
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/api/sessions/create", post(create_handler))
        .route("/api/sessions/join", post(join_handler))
        .route("/api/sessions/:code", get(session_handler))
        .route("/api/sessions/:code/messages", get(messages_handler))
        .route("/api/sessions/:code/uploads/:name", put(upload_handler))
        .route("/api/translate", post(translate_handler))
        .route("/api/session/end", post(end_handler))
        .route("/api/jobs/cleanup", get(cleanup_handler))
        .route("/api/jobs/meter-backfill", get(backfill_handler))
        .route("/api/jobs/status", get(status_handler))
        .with_state(ctx)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(ctx: Arc<AppContext>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.http.host, ctx.config.http.port);

    let app = build_router(ctx);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("EOV6 HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SecretQuery {
    pub secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

fn reply<T: serde::Serialize>(status: StatusCode, body: &T) -> Reply {
    match serde_json::to_value(body) {
        Ok(v) => (status, v),
        Err(e) => ApiError::Internal(e.to_string()).into_parts(),
    }
}

fn respond<T: serde::Serialize>(status: StatusCode, result: Result<T, ApiError>) -> Reply {
    match result {
        Ok(body) => reply(status, &body),
        Err(e) => e.into_parts(),
    }
}

/// Unwrap a JSON body, mapping any extractor rejection to `invalid_body`.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(v)) => Ok(v),
        Err(e) => {
            tracing::debug!(error = %e, "Rejected request body");
            Err(ApiError::BadRequest("invalid_body"))
        }
    }
}

/// Inner health check: queries the store and returns (status_code, body).
pub async fn health_inner(ctx: &AppContext) -> Reply {
    match ctx.store.health().await {
        Ok(detail) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": ctx.store.name(),
                "storeDetail": detail,
                "blobs": ctx.blobs.name(),
                "translator": ctx.translator.name(),
                "meter": ctx.meter.name(),
                "identity": ctx.identity.name(),
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": "store_unavailable",
                }),
            )
        }
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "eov6/1",
    })
}

pub async fn create_inner(ctx: &AppContext, headers: &HeaderMap) -> Reply {
    let result = async {
        let agent = authenticate_agent(ctx, headers).await?;
        let session = sessions::create_session(ctx, &agent, Utc::now()).await?;
        Ok::<_, ApiError>(serde_json::json!({
            "code": session.code,
            "expiresAt": session.expires_at,
        }))
    }
    .await;
    respond(StatusCode::CREATED, result)
}

pub async fn join_inner(ctx: &AppContext, req: Result<JoinRequest, ApiError>) -> Reply {
    let result = async {
        let session = sessions::join_session(ctx, &req?, Utc::now()).await?;
        Ok::<_, ApiError>(serde_json::json!({
            "ok": true,
            "code": session.code,
            "joinedAt": session.caller_joined_at,
            "expiresAt": session.expires_at,
        }))
    }
    .await;
    respond(StatusCode::OK, result)
}

pub async fn session_inner(ctx: &AppContext, code: &str) -> Reply {
    respond(StatusCode::OK, sessions::get_session(ctx, code, Utc::now()).await)
}

pub async fn messages_inner(ctx: &AppContext, code: &str, limit: Option<usize>) -> Reply {
    let result = sessions::list_messages(ctx, code, limit, Utc::now())
        .await
        .map(|messages| {
            let items: Vec<serde_json::Value> = messages
                .into_iter()
                .map(|m| {
                    serde_json::json!({
                        "id": m.id,
                        "sender": m.sender,
                        "text": m.text,
                        "translatedText": m.translated_text,
                        "targetLang": m.target_lang,
                        "createdAt": m.created_at,
                    })
                })
                .collect();
            serde_json::json!({ "code": code, "messages": items })
        });
    respond(StatusCode::OK, result)
}

pub async fn upload_inner(ctx: &AppContext, code: &str, name: &str, bytes: &[u8]) -> Reply {
    let result = sessions::store_upload(ctx, code, name, bytes, Utc::now())
        .await
        .map(|key| serde_json::json!({ "key": key, "size": bytes.len() }));
    respond(StatusCode::CREATED, result)
}

pub async fn translate_inner(ctx: &AppContext, req: Result<TranslateRequest, ApiError>) -> Reply {
    let req = match req {
        Ok(r) => r,
        Err(e) => return e.into_parts(),
    };
    let now = Utc::now();
    match req.mode {
        TranslateMode::Preview => respond(StatusCode::OK, translate::preview(ctx, &req, now).await),
        TranslateMode::Commit => respond(StatusCode::OK, translate::commit(ctx, &req, now).await),
    }
}

pub async fn end_inner(ctx: &AppContext, req: Result<EndRequest, ApiError>) -> Reply {
    let result = async {
        let outcome = sessions::end_session(ctx, &req?, Utc::now()).await?;
        let mut body = serde_json::to_value(&outcome).map_err(|e| ApiError::Internal(e.to_string()))?;
        body["ok"] = serde_json::json!(true);
        Ok::<_, ApiError>(body)
    }
    .await;
    respond(StatusCode::OK, result)
}

fn job_reply<T: serde::Serialize>(caller: &JobCaller, report: Result<T>) -> Reply {
    match report {
        Ok(report) => {
            let (status, mut body) = reply(StatusCode::OK, &report);
            if status == StatusCode::OK {
                body["ok"] = serde_json::json!(true);
                body["trigger"] = serde_json::json!(caller.trigger().as_str());
            }
            (status, body)
        }
        Err(e) => ApiError::Internal(format!("{:#}", e)).into_parts(),
    }
}

pub async fn cleanup_inner(ctx: &AppContext, headers: &HeaderMap, query: &CleanupQuery) -> Reply {
    let caller = match authorize_job(ctx, headers, query.secret.as_deref()).await {
        Ok(c) => c,
        Err(e) => return e.into_parts(),
    };
    let opts = match CleanupOptions::from_query(query) {
        Ok(o) => o,
        Err(e) => return e.into_parts(),
    };
    if let JobCaller::Staff { email } = &caller {
        tracing::info!(staff = %email, mode = ?opts.mode, dry_run = opts.dry_run, "Cleanup triggered by staff");
    }
    job_reply(&caller, run_cleanup(ctx, &opts, caller.trigger()).await)
}

pub async fn backfill_inner(ctx: &AppContext, headers: &HeaderMap, secret: Option<&str>) -> Reply {
    let caller = match authorize_job(ctx, headers, secret).await {
        Ok(c) => c,
        Err(e) => return e.into_parts(),
    };
    job_reply(&caller, run_backfill_job(ctx, caller.trigger()).await)
}

pub async fn status_inner(ctx: &AppContext, headers: &HeaderMap, secret: Option<&str>) -> Reply {
    let result = async {
        authorize_job(ctx, headers, secret).await?;
        let cleanup = ctx.store.last_job_run(JobKind::Cleanup).await?;
        let backfill = ctx.store.last_job_run(JobKind::MeterBackfill).await?;
        let pending = ctx.store.pending_backfill_count().await?;

        let view = |run: Option<eov6_core::models::JobRun>| {
            run.map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "trigger": r.trigger,
                    "startedAt": r.started_at,
                    "finishedAt": r.finished_at,
                    "summary": r.summary,
                })
            })
        };
        Ok::<_, ApiError>(serde_json::json!({
            "ok": true,
            "jobs": {
                "cleanup": view(cleanup),
                "meterBackfill": view(backfill),
            },
            "pendingBackfills": pending,
        }))
    }
    .await;
    respond(StatusCode::OK, result)
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let (status, body) = health_inner(&ctx).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn create_handler(State(ctx): State<Arc<AppContext>>, headers: HeaderMap) -> impl IntoResponse {
    let (status, body) = create_inner(&ctx, &headers).await;
    (status, Json(body))
}

pub async fn join_handler(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = join_inner(&ctx, json_body(payload)).await;
    (status, Json(body))
}

pub async fn session_handler(State(ctx): State<Arc<AppContext>>, Path(code): Path<String>) -> impl IntoResponse {
    let (status, body) = session_inner(&ctx, &code).await;
    (status, Json(body))
}

pub async fn messages_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(code): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> impl IntoResponse {
    let (status, body) = messages_inner(&ctx, &code, q.limit).await;
    (status, Json(body))
}

pub async fn upload_handler(
    State(ctx): State<Arc<AppContext>>,
    Path((code, name)): Path<(String, String)>,
    bytes: Bytes,
) -> impl IntoResponse {
    let (status, body) = upload_inner(&ctx, &code, &name, &bytes).await;
    (status, Json(body))
}

pub async fn translate_handler(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<TranslateRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = translate_inner(&ctx, json_body(payload)).await;
    (status, Json(body))
}

pub async fn end_handler(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<EndRequest>, JsonRejection>,
) -> impl IntoResponse {
    let (status, body) = end_inner(&ctx, json_body(payload)).await;
    (status, Json(body))
}

pub async fn cleanup_handler(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(query): Query<CleanupQuery>,
) -> impl IntoResponse {
    let (status, body) = cleanup_inner(&ctx, &headers, &query).await;
    (status, Json(body))
}

pub async fn backfill_handler(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(q): Query<SecretQuery>,
) -> impl IntoResponse {
    let (status, body) = backfill_inner(&ctx, &headers, q.secret.as_deref()).await;
    (status, Json(body))
}

pub async fn status_handler(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Query(q): Query<SecretQuery>,
) -> impl IntoResponse {
    let (status, body) = status_inner(&ctx, &headers, q.secret.as_deref()).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
