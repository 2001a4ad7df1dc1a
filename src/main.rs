//! Alert service entrypoint.
//!
//! Runs the HTTP API, the periodic beat dispatcher and the worker pools in
//! one process. The scraper service (`scraperd`) runs separately and is
//! reached over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketwatch_backend::config::Config;
use marketwatch_backend::context::AppContext;
use marketwatch_backend::kv::RedisKv;
use marketwatch_backend::scraper::HttpScraperClient;
use marketwatch_backend::storage::Database;
use marketwatch_backend::tasks::{beat, worker};
use marketwatch_backend::api;

#[derive(Parser, Debug)]
#[command(name = "alertd", about = "Price-monitoring alert service")]
struct Args {
    /// Run only the API (no beat, no workers).
    #[arg(long)]
    api_only: bool,

    /// Run only beat + workers (no API listener).
    #[arg(long)]
    worker_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketwatch_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cfg = Arc::new(Config::from_env()?);
    info!(port = cfg.port, "starting alert service");

    let kv = Arc::new(
        RedisKv::connect(&cfg.redis_url)
            .await
            .context("redis connection failed")?,
    );
    let db = Database::open(&cfg.database_path).context("database open failed")?;
    let scraper = Arc::new(HttpScraperClient::new(&cfg));

    let ctx = Arc::new(AppContext::new(cfg.clone(), kv, db, scraper));

    let mut handles = Vec::new();
    if !args.api_only {
        handles.extend(beat::spawn_beat(ctx.clone()));
        handles.extend(worker::spawn_workers(ctx.clone()));
        info!("beat and worker pools started");
    }

    if args.worker_only {
        // Background roles only; park on the spawned tasks.
        for handle in handles {
            let _ = handle.await;
        }
        return Ok(());
    }

    let app = api::router(ctx.clone()).layer(CorsLayer::permissive());
    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("failed binding port {}", cfg.port))?;
    info!(addr = %listener.local_addr()?, "alert API listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
