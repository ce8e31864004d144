use std::sync::Arc;

use clap::Parser;
use eov6_core::Eov6Config;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use eov6_server::AppContext;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "eov6.toml")]
    config: String,

    /// Check store connectivity and exit
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match Eov6Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.clone()));
    fmt().with_env_filter(filter).init();

    let ctx = match AppContext::from_config(config).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to initialise backends: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match ctx.store.health().await {
            Ok(v) => println!("✅ Store ({}) connected: {}", ctx.store.name(), v),
            Err(e) => {
                println!("❌ Store ({}) check failed: {}", ctx.store.name(), e);
                std::process::exit(1);
            }
        }
        println!("✅ Translator: {}", ctx.translator.name());
        println!("✅ Meter: {}", ctx.meter.name());
        println!("✅ Identity: {}", ctx.identity.name());
        println!("✅ EOV6 health check passed");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Meter backfill worker (no-op unless enabled)
    let worker = tokio::spawn(eov6_server::subsystems::backfill::run_backfill_worker(
        ctx.clone(),
        tx.subscribe(),
    ));

    if ctx.config.http.enabled {
        eov6_server::http::start_http_server(ctx.clone(), tx.subscribe()).await?;
    } else {
        tracing::warn!("HTTP API disabled via config; running background jobs only");
        let mut shutdown = tx.subscribe();
        let _ = shutdown.recv().await;
    }

    let _ = worker.await;
    Ok(())
}
