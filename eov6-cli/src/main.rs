//! eov6-cli: trigger and inspect EOV6 maintenance jobs
//!
//! Talks to a running `eov6-server` over HTTP, authenticating with the shared
//! cron secret in the `x-cron-secret` header.
//!
//! # Subcommands
//! - `cleanup [--mode expired|stale|all] [--codes a,b] [--orphans] [--dry-run] [--max N]`
//! - `backfill`: drain due meter backfill records
//! - `status`: server health plus last job runs

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "eov6-cli", version, about = "EOV6 maintenance job CLI")]
struct Cli {
    /// EOV6 HTTP server URL (overrides EOV6_HTTP_URL env var)
    #[arg(long, env = "EOV6_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Shared job secret
    #[arg(long, env = "CRON_SECRET", hide_env_values = true, default_value = "")]
    secret: String,

    /// Print the raw JSON response
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Expired,
    Stale,
    All,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Expired => "expired",
            Mode::Stale => "stale",
            Mode::All => "all",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Purge expired and stale sessions
    Cleanup {
        #[arg(long, value_enum, default_value_t = Mode::All)]
        mode: Mode,

        /// Comma-separated session codes to purge explicitly
        #[arg(long, value_delimiter = ',')]
        codes: Vec<String>,

        /// Also sweep upload prefixes with no live session
        #[arg(long)]
        orphans: bool,

        /// Only report candidates
        #[arg(long)]
        dry_run: bool,

        /// Cap on sessions purged (never above the server's cap)
        #[arg(long)]
        max: Option<usize>,
    },

    /// Drain due meter backfill records
    Backfill,

    /// Show server health and last job runs
    Status,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub mode: String,
    pub dry_run: bool,
    pub candidates: usize,
    #[serde(default)]
    pub candidate_codes: Vec<String>,
    pub sessions_deleted: usize,
    pub child_docs_deleted: usize,
    pub blobs_deleted: usize,
    #[serde(default)]
    pub orphan_prefixes_deleted: usize,
    #[serde(default)]
    pub orphan_blobs_deleted: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub scanned: usize,
    pub recorded: usize,
    pub rescheduled: usize,
    pub failed: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

// ============================================================================
// Request building / formatting
// ============================================================================

/// Query parameters for `GET /api/jobs/cleanup`.
pub fn cleanup_params(
    mode: &str,
    codes: &[String],
    orphans: bool,
    dry_run: bool,
    max: Option<usize>,
) -> Vec<(&'static str, String)> {
    let mut params = vec![("mode", mode.to_string())];
    let codes: Vec<&str> = codes.iter().map(|c| c.trim()).filter(|c| !c.is_empty()).collect();
    if !codes.is_empty() {
        params.push(("codes", codes.join(",")));
    }
    if orphans {
        params.push(("orphans", "1".to_string()));
    }
    if dry_run {
        params.push(("dryRun", "1".to_string()));
    }
    if let Some(max) = max {
        params.push(("max", max.to_string()));
    }
    params
}

pub fn format_cleanup(r: &CleanupReport) -> String {
    let mut out = String::new();
    if r.dry_run {
        out.push_str(&format!("Dry run ({}): {} candidate(s)\n", r.mode, r.candidates));
        for code in &r.candidate_codes {
            out.push_str(&format!("  {}\n", code));
        }
    } else {
        out.push_str(&format!(
            "Cleanup ({}): {} candidate(s), {} session(s), {} child record(s), {} blob(s) deleted\n",
            r.mode, r.candidates, r.sessions_deleted, r.child_docs_deleted, r.blobs_deleted
        ));
        if r.orphan_prefixes_deleted > 0 {
            out.push_str(&format!(
                "Orphans: {} prefix(es), {} blob(s) deleted\n",
                r.orphan_prefixes_deleted, r.orphan_blobs_deleted
            ));
        }
    }
    for e in &r.errors {
        out.push_str(&format!("  error: {}\n", e));
    }
    out.push_str(&format!("Took {}ms", r.elapsed_ms));
    out
}

pub fn format_backfill(r: &BackfillReport) -> String {
    let mut out = format!(
        "Backfill: {} due, {} recorded, {} rescheduled, {} failed",
        r.scanned, r.recorded, r.rescheduled, r.failed
    );
    for e in &r.errors {
        out.push_str(&format!("\n  error: {}", e));
    }
    out
}

fn describe_run(run: &serde_json::Value) -> String {
    if run.is_null() {
        return "never".to_string();
    }
    format!(
        "{} ({})",
        run["finishedAt"].as_str().unwrap_or("?"),
        run["trigger"].as_str().unwrap_or("?")
    )
}

pub fn format_status(health: &serde_json::Value, jobs: &serde_json::Value) -> String {
    [
        format!("EOV6 server:   {}", health["status"].as_str().unwrap_or("unknown")),
        format!("Version:       {}", health["version"].as_str().unwrap_or("?")),
        format!("Store:         {}", health["store"].as_str().unwrap_or("?")),
        format!("Last cleanup:  {}", describe_run(&jobs["jobs"]["cleanup"])),
        format!("Last backfill: {}", describe_run(&jobs["jobs"]["meterBackfill"])),
        format!("Pending meter backfills: {}", jobs["pendingBackfills"].as_i64().unwrap_or(0)),
    ]
    .join("\n")
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

/// GET a job endpoint with the shared secret and return the JSON body.
fn get_job(server: &str, secret: &str, path: &str, params: &[(&str, String)]) -> anyhow::Result<serde_json::Value> {
    if secret.is_empty() {
        anyhow::bail!("no job secret; pass --secret or set CRON_SECRET");
    }

    let url = format!("{}{}", server, path);
    let resp = client(120)?
        .get(&url)
        .header("x-cron-secret", secret)
        .query(params)
        .send()
        .map_err(|e| anyhow::anyhow!("connection failed to {}: {}", url, e))?;

    let status = resp.status();
    let body: serde_json::Value = resp.json().unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "server returned {}: {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(body)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn do_cleanup(cli: &Cli, server: &str, params: Vec<(&'static str, String)>) -> anyhow::Result<()> {
    let body = get_job(server, &cli.secret, "/api/jobs/cleanup", &params)?;
    if cli.json {
        return print_json(&body);
    }
    let report: CleanupReport = serde_json::from_value(body)?;
    println!("{}", format_cleanup(&report));
    if !report.errors.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

fn do_backfill(cli: &Cli, server: &str) -> anyhow::Result<()> {
    let body = get_job(server, &cli.secret, "/api/jobs/meter-backfill", &[])?;
    if cli.json {
        return print_json(&body);
    }
    let report: BackfillReport = serde_json::from_value(body)?;
    println!("{}", format_backfill(&report));
    Ok(())
}

fn do_status(cli: &Cli, server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let health: serde_json::Value = match client(10)?.get(&url).send() {
        Ok(r) if r.status().is_success() => r.json().unwrap_or_default(),
        Ok(r) => anyhow::bail!("server unhealthy (HTTP {})", r.status()),
        Err(e) => anyhow::bail!("cannot reach {}: {}", url, e),
    };

    let jobs = get_job(server, &cli.secret, "/api/jobs/status", &[])?;
    if cli.json {
        return print_json(&serde_json::json!({ "health": health, "jobs": jobs }));
    }
    println!("{}", format_status(&health, &jobs));
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match &cli.command {
        Commands::Cleanup {
            mode,
            codes,
            orphans,
            dry_run,
            max,
        } => do_cleanup(&cli, &server, cleanup_params(mode.as_str(), codes, *orphans, *dry_run, *max)),
        Commands::Backfill => do_backfill(&cli, &server),
        Commands::Status => do_status(&cli, &server),
    };

    if let Err(e) = result {
        eprintln!("eov6-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
