//! Scraper service entrypoint.
//!
//! Exposes `POST /scraper/parse` plus health and metrics, and owns the
//! whole anti-blocking stack: throttling, identity rotation, block
//! recovery, content cache and audit logging.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketwatch_backend::audit::AuditLog;
use marketwatch_backend::blockguard::{BlockRecovery, BrowserClient};
use marketwatch_backend::cache::ContentCache;
use marketwatch_backend::circuit::CircuitBreaker;
use marketwatch_backend::config::Config;
use marketwatch_backend::identity::{CookieManager, UserAgentManager};
use marketwatch_backend::kv::RedisKv;
use marketwatch_backend::metrics::Metrics;
use marketwatch_backend::robots::RobotsTxt;
use marketwatch_backend::scraper::parser::MeliParser;
use marketwatch_backend::scraper::routes::{router, ScraperState};
use marketwatch_backend::scraper::{HttpFetcher, ScraperPipeline};
use marketwatch_backend::throttle::HumanizedDelay;

#[derive(Parser, Debug)]
#[command(name = "scraperd", about = "Marketplace scraper service")]
struct Args {
    /// Override the listening port.
    #[arg(long)]
    port: Option<u16>,
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
    let port = args.port.unwrap_or(cfg.scraper_port);
    info!(port, "starting scraper service");

    let kv = Arc::new(
        RedisKv::connect(&cfg.redis_url)
            .await
            .context("redis connection failed")?,
    );
    let metrics = Arc::new(Metrics::new());

    let ua_manager = Arc::new(UserAgentManager::default());
    let cookie_manager = Arc::new(CookieManager::new());
    let delay = Arc::new(Mutex::new(HumanizedDelay::new(&cfg)));
    let browser = Arc::new(BrowserClient::new(
        cfg.browser_render_url.clone(),
        cfg.browser_timeout_secs,
    ));
    if browser.enabled() {
        info!("browser rendering fallback enabled");
    }

    let recovery = Arc::new(BlockRecovery::new(
        kv.clone(),
        metrics.clone(),
        ua_manager.clone(),
        cookie_manager.clone(),
        delay.clone(),
        browser,
    ));

    let pipeline = Arc::new(ScraperPipeline::new(
        cfg.clone(),
        kv.clone(),
        metrics.clone(),
        Arc::new(ContentCache::new(
            kv.clone(),
            metrics.clone(),
            cfg.cache_base_ttl,
            cfg.cache_max_multiplier,
        )),
        Arc::new(CircuitBreaker::new(kv.clone(), metrics.clone(), &cfg)),
        Arc::new(RobotsTxt::new(kv.clone(), cfg.robots_cache_ttl)),
        ua_manager,
        cookie_manager,
        delay,
        recovery,
        Arc::new(HttpFetcher::new(&cfg)),
        Arc::new(MeliParser),
        Arc::new(AuditLog::new(cfg.audit_dir.clone(), metrics.clone())),
    ));

    let state = ScraperState {
        pipeline,
        kv,
        metrics,
    };
    let app = router(state).layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed binding port {}", port))?;
    info!(addr = %listener.local_addr()?, "scraper API listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
