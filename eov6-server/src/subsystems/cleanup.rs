//! Session cleanup job
//!
//! Purges expired and stale sessions across the record store and blob
//! storage. A purge removes, in order:
//! 1. child records (messages, details) in bounded batches
//! 2. the session record
//! 3. every blob under `uploads/{code}/`
//!
//! Candidate failures are reported and never abort the run. A second run over
//! the same data finds nothing to delete.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use eov6_core::blob::{session_prefix, UPLOADS_ROOT};
use eov6_core::models::{is_valid_code, JobKind, JobRun, JobTrigger, StaleCutoffs};
use eov6_core::StoreError;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::ApiError;

/// Sessions purged concurrently. Prefixes are disjoint so purges never contend.
const PURGE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    Expired,
    Stale,
    #[default]
    All,
}

impl CleanupMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expired" => Some(CleanupMode::Expired),
            "stale" => Some(CleanupMode::Stale),
            "all" | "" => Some(CleanupMode::All),
            _ => None,
        }
    }

    fn includes_expired(self) -> bool {
        matches!(self, CleanupMode::Expired | CleanupMode::All)
    }

    fn includes_stale(self) -> bool {
        matches!(self, CleanupMode::Stale | CleanupMode::All)
    }
}

/// Raw query parameters of `GET /api/jobs/cleanup`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupQuery {
    pub mode: Option<String>,
    pub codes: Option<String>,
    pub orphans: Option<String>,
    pub dry_run: Option<String>,
    pub max: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    pub mode: CleanupMode,
    pub codes: Vec<String>,
    pub orphans: bool,
    pub dry_run: bool,
    pub max: Option<usize>,
}

impl CleanupOptions {
    pub fn from_query(q: &CleanupQuery) -> Result<Self, ApiError> {
        let mode = match q.mode.as_deref() {
            Some(m) => CleanupMode::parse(m).ok_or(ApiError::BadRequest("invalid_mode"))?,
            None => CleanupMode::All,
        };

        let mut codes = Vec::new();
        for raw in q.codes.as_deref().unwrap_or_default().split(',') {
            let code = raw.trim();
            if code.is_empty() {
                continue;
            }
            if !is_valid_code(code) {
                return Err(ApiError::BadRequest("invalid_code"));
            }
            codes.push(code.to_string());
        }

        let max = match q.max.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(m) => Some(m.parse::<usize>().map_err(|_| ApiError::BadRequest("invalid_max"))?),
            None => None,
        };

        Ok(Self {
            mode,
            codes,
            orphans: parse_flag(q.orphans.as_deref()),
            dry_run: parse_flag(q.dry_run.as_deref()),
            max,
        })
    }
}

fn parse_flag(v: Option<&str>) -> bool {
    matches!(
        v.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub mode: CleanupMode,
    pub dry_run: bool,
    pub candidates: usize,
    pub candidate_codes: Vec<String>,
    pub sessions_deleted: usize,
    pub child_docs_deleted: usize,
    pub blobs_deleted: usize,
    pub orphan_prefixes_scanned: usize,
    pub orphan_prefixes_deleted: usize,
    pub orphan_blobs_deleted: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl CleanupReport {
    /// Whether the run changed anything.
    pub fn deleted_anything(&self) -> bool {
        self.sessions_deleted + self.child_docs_deleted + self.blobs_deleted + self.orphan_blobs_deleted > 0
    }
}

/// Counts for one purged session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPurge {
    pub children: usize,
    pub record_deleted: bool,
    pub blobs: usize,
}

/// Merge candidate queries in order: explicit codes, expired, closed-stale,
/// created-stale, untimestamped-stale. Deduplicated and capped.
pub async fn select_candidates(
    ctx: &AppContext,
    opts: &CleanupOptions,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    let configured = ctx.config.cleanup.max_sessions;
    let cap = opts.max.map_or(configured, |m| m.min(configured));

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut take = |codes: Vec<String>, out: &mut Vec<String>| {
        for code in codes {
            if out.len() >= cap {
                break;
            }
            if seen.insert(code.clone()) {
                out.push(code);
            }
        }
    };

    take(opts.codes.clone(), &mut out);

    if opts.mode.includes_expired() && out.len() < cap {
        take(ctx.store.expired_codes(now, cap).await?, &mut out);
    }

    if opts.mode.includes_stale() {
        let cutoffs = stale_cutoffs(ctx, now);
        if out.len() < cap {
            take(ctx.store.closed_before(cutoffs.closed_before, cap).await?, &mut out);
        }
        if out.len() < cap {
            take(ctx.store.created_before(cutoffs.created_before, cap).await?, &mut out);
        }
        if out.len() < cap {
            take(ctx.store.untimestamped_before(cutoffs.created_before, cap).await?, &mut out);
        }
    }

    Ok(out)
}

pub fn stale_cutoffs(ctx: &AppContext, now: DateTime<Utc>) -> StaleCutoffs {
    StaleCutoffs::new(
        now,
        Duration::minutes(ctx.config.cleanup.closed_grace_minutes),
        Duration::hours(ctx.config.cleanup.max_age_hours),
    )
}

/// Delete every child record of `code` in batches until a batch comes back empty.
pub async fn purge_children(ctx: &AppContext, code: &str) -> Result<usize, StoreError> {
    let batch = ctx.config.cleanup.batch_size.max(1);
    let mut total = 0;
    loop {
        let n = ctx.store.delete_children_batch(code, batch).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
}

/// Children, then record, then blobs.
pub async fn purge_session(ctx: &AppContext, code: &str) -> Result<SessionPurge> {
    let children = purge_children(ctx, code).await?;
    let record_deleted = ctx.store.delete_session(code).await?;
    let blobs = ctx.blobs.delete_prefix(&session_prefix(code)).await?;
    Ok(SessionPurge {
        children,
        record_deleted,
        blobs,
    })
}

/// Delete blob prefixes under `uploads/` that have no record or whose record
/// is itself purgeable. Codes in `skip` were already handled this run.
///
/// At most `orphan_cap` prefixes are deleted per run; live and skipped
/// prefixes do not count against the cap.
pub async fn sweep_orphans(
    ctx: &AppContext,
    skip: &HashSet<String>,
    now: DateTime<Utc>,
    report: &mut CleanupReport,
) -> Result<()> {
    let cap = ctx.config.cleanup.orphan_cap;
    let prefixes = ctx.blobs.list_child_prefixes(UPLOADS_ROOT).await?;
    let cutoffs = stale_cutoffs(ctx, now);

    for code in prefixes {
        if report.orphan_prefixes_deleted >= cap {
            tracing::info!(cap, "Orphan sweep cap reached");
            break;
        }
        report.orphan_prefixes_scanned += 1;
        if !is_valid_code(&code) || skip.contains(&code) {
            continue;
        }

        let orphaned = match ctx.store.get_session(&code).await {
            Ok(None) => true,
            Ok(Some(session)) => session.is_purgeable(now, &cutoffs),
            Err(e) => {
                report.errors.push(format!("orphan {}: {}", code, e));
                continue;
            }
        };
        if !orphaned {
            continue;
        }

        match ctx.blobs.delete_prefix(&session_prefix(&code)).await {
            Ok(n) => {
                report.orphan_prefixes_deleted += 1;
                report.orphan_blobs_deleted += n;
                tracing::debug!(code = %code, blobs = n, "Orphan upload prefix deleted");
            }
            Err(e) => report.errors.push(format!("orphan {}: {}", code, e)),
        }
    }
    Ok(())
}

/// Run one cleanup pass and record it as a job run (dry runs are not recorded).
pub async fn run_cleanup(
    ctx: &AppContext,
    opts: &CleanupOptions,
    trigger: JobTrigger,
) -> Result<CleanupReport> {
    let started = Instant::now();
    let started_at = Utc::now();
    let now = started_at;

    let candidates = select_candidates(ctx, opts, now).await?;
    let mut report = CleanupReport {
        mode: opts.mode,
        dry_run: opts.dry_run,
        candidates: candidates.len(),
        candidate_codes: candidates.clone(),
        ..Default::default()
    };

    if opts.dry_run {
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(mode = ?opts.mode, candidates = report.candidates, "Cleanup dry run");
        return Ok(report);
    }

    let results: Vec<(String, Result<SessionPurge>)> = stream::iter(candidates.iter().cloned())
        .map(|code| async move {
            let res = purge_session(ctx, &code).await;
            (code, res)
        })
        .buffer_unordered(PURGE_CONCURRENCY)
        .collect()
        .await;

    for (code, res) in results {
        match res {
            Ok(p) => {
                report.sessions_deleted += usize::from(p.record_deleted);
                report.child_docs_deleted += p.children;
                report.blobs_deleted += p.blobs;
            }
            Err(e) => {
                tracing::warn!(code = %code, error = %e, "Session purge failed");
                report.errors.push(format!("{}: {}", code, e));
            }
        }
    }

    if opts.orphans {
        let skip: HashSet<String> = candidates.into_iter().collect();
        if let Err(e) = sweep_orphans(ctx, &skip, now, &mut report).await {
            tracing::warn!(error = %e, "Orphan sweep failed");
            report.errors.push(format!("orphans: {}", e));
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        mode = ?opts.mode,
        candidates = report.candidates,
        sessions = report.sessions_deleted,
        children = report.child_docs_deleted,
        blobs = report.blobs_deleted,
        orphan_blobs = report.orphan_blobs_deleted,
        errors = report.errors.len(),
        elapsed_ms = report.elapsed_ms,
        "Cleanup complete"
    );

    let run = JobRun::new(
        JobKind::Cleanup,
        trigger,
        started_at,
        serde_json::to_value(&report)?,
    );
    if let Err(e) = ctx.store.record_job_run(&run).await {
        tracing::warn!(error = %e, "Failed to record cleanup run");
    }

    Ok(report)
}
