//! Periodic beat: dispatches due collections and housekeeping.
//!
//! One instance per deployment. Monitored products dispatch every 5
//! minutes, competitors every 8, gauges every minute, cache cleanup once a
//! day at 03:00.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{Timelike, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::kv::is_scraping_suspended;
use crate::ratelimit::RateLimiter;
use crate::tasks::housekeeping;
use crate::tasks::queue::{
    TaskEnvelope, LANE_SCRAPING, TASK_COLLECT_COMPETITOR, TASK_COLLECT_PRODUCT,
    TASK_COMPARE_PRICES,
};
use crate::tasks::scrape::{CollectCompetitorArgs, CollectProductArgs};

const MONITORED_TICK: Duration = Duration::from_secs(5 * 60);
const COMPETITOR_TICK: Duration = Duration::from_secs(8 * 60);
const METRICS_TICK: Duration = Duration::from_secs(60);
const PROMOTE_TICK: Duration = Duration::from_secs(5);
const CLEANUP_HOUR: u32 = 3;

/// One dispatch pass over due monitored products. Returns how many tasks
/// were enqueued.
pub async fn dispatch_monitored_tick(ctx: &AppContext) -> Result<usize> {
    let start = Instant::now();

    if !ctx.circuit.allow_request("recheck_monitored_products").await {
        error!("circuit open, skipping monitored dispatch");
        return Ok(0);
    }
    if is_scraping_suspended(ctx.kv.as_ref(), &ctx.metrics).await {
        warn!("scraping suspended, skipping monitored dispatch");
        return Ok(0);
    }

    let limiter = RateLimiter::new(
        ctx.kv.clone(),
        "rate:recheck_monitored_products",
        ctx.cfg.batch_size_scraping as u64,
        60,
    );
    if !limiter.allow_request(None).await.unwrap_or(false) {
        warn!("monitored dispatch rate limited");
        return Ok(0);
    }

    let products = ctx
        .db
        .list_monitored_by_type(crate::models::MonitoringType::Scraping)?;
    let mut due = Vec::new();
    for product in products {
        if ctx.scheduler.should_recheck(&product.id.to_string()).await {
            due.push(product);
        }
    }
    let batch: Vec<_> = due.into_iter().take(ctx.cfg.batch_size_scraping).collect();

    for product in &batch {
        info!(product_url = %product.product_url, user_id = %product.user_id, "dispatching collection");
        let args = CollectProductArgs {
            url: product.product_url.clone(),
            user_id: product.user_id,
            name: product.name.clone(),
            target_price: product
                .target_price
                .and_then(|p| rust_decimal::prelude::ToPrimitive::to_f64(&p))
                .unwrap_or(0.0),
            monitored_id: Some(product.id),
        };
        let envelope = TaskEnvelope::new(
            TASK_COLLECT_PRODUCT,
            LANE_SCRAPING,
            serde_json::to_value(&args)?,
        );
        ctx.queue.enqueue(&envelope).await?;
        ctx.metrics.tasks_dispatched_total.inc(TASK_COLLECT_PRODUCT);
    }

    let _ = ctx
        .kv
        .set("beat:last_scraping", &Utc::now().to_rfc3339())
        .await;
    ctx.metrics
        .scraping_latency_seconds
        .observe(start.elapsed().as_secs_f64());
    info!(dispatched = batch.len(), "monitored dispatch tick done");
    Ok(batch.len())
}

/// One dispatch pass over competitor listings, chased by one comparison
/// per affected product.
pub async fn dispatch_competitor_tick(ctx: &AppContext) -> Result<usize> {
    let start = Instant::now();

    if !ctx.circuit.allow_request("recheck_competitor_products").await {
        error!("circuit open, skipping competitor dispatch");
        return Ok(0);
    }
    if is_scraping_suspended(ctx.kv.as_ref(), &ctx.metrics).await {
        warn!("scraping suspended, skipping competitor dispatch");
        return Ok(0);
    }

    let limiter = RateLimiter::new(
        ctx.kv.clone(),
        "rate:recheck_competitor_products",
        ctx.cfg.batch_size_competitor as u64,
        60,
    );
    if !limiter.allow_request(None).await.unwrap_or(false) {
        warn!("competitor dispatch rate limited");
        return Ok(0);
    }

    let competitors = ctx.db.list_all_competitors()?;
    let batch: Vec<_> = competitors
        .into_iter()
        .take(ctx.cfg.batch_size_competitor)
        .collect();

    let mut affected = std::collections::HashSet::new();
    for competitor in &batch {
        affected.insert(competitor.monitored_product_id);
        let args = CollectCompetitorArgs {
            monitored_product_id: competitor.monitored_product_id,
            url: competitor.product_url.clone(),
        };
        let envelope = TaskEnvelope::new(
            TASK_COLLECT_COMPETITOR,
            LANE_SCRAPING,
            serde_json::to_value(&args)?,
        );
        ctx.queue.enqueue(&envelope).await?;
        ctx.metrics
            .tasks_dispatched_total
            .inc(TASK_COLLECT_COMPETITOR);
    }

    let _ = ctx
        .kv
        .set("beat:last_competitor", &Utc::now().to_rfc3339())
        .await;

    for monitored_id in &affected {
        let envelope = TaskEnvelope::new(
            TASK_COMPARE_PRICES,
            crate::tasks::queue::LANE_MONITOR,
            serde_json::json!({"monitored_product_id": monitored_id}),
        );
        ctx.queue.enqueue(&envelope).await?;
    }

    ctx.metrics
        .scraping_latency_seconds
        .observe(start.elapsed().as_secs_f64());
    info!(dispatched = batch.len(), comparisons = affected.len(), "competitor dispatch tick done");
    Ok(batch.len())
}

/// Spawns all recurring beat jobs.
pub fn spawn_beat(ctx: Arc<AppContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(MONITORED_TICK);
            loop {
                tick.tick().await;
                if let Err(err) = dispatch_monitored_tick(&ctx).await {
                    error!(error = %err, "monitored dispatch failed");
                }
            }
        }));
    }

    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(COMPETITOR_TICK);
            loop {
                tick.tick().await;
                if let Err(err) = dispatch_competitor_tick(&ctx).await {
                    error!(error = %err, "competitor dispatch failed");
                }
            }
        }));
    }

    {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_TICK);
            loop {
                tick.tick().await;
                let _ = housekeeping::collect_queue_metrics(&ctx).await;
                let _ = housekeeping::collect_audit_metrics(&ctx).await;
                let _ = housekeeping::collect_db_metrics(&ctx).await;
            }
        }));
    }

    {
        // Daily cache cleanup at 03:00.
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut last_run_day: Option<chrono::NaiveDate> = None;
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let now = Utc::now();
                if now.hour() == CLEANUP_HOUR && last_run_day != Some(now.date_naive()) {
                    last_run_day = Some(now.date_naive());
                    if let Err(err) = housekeeping::cleanup_cache(&ctx).await {
                        error!(error = %err, "cache cleanup failed");
                    }
                }
            }
        }));
    }

    {
        // Delayed-task promotion safety net next to the worker loops.
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROMOTE_TICK);
            loop {
                tick.tick().await;
                if let Err(err) = ctx.queue.promote_due().await {
                    warn!(error = %err, "delayed-task promotion failed");
                }
            }
        }));
    }

    handles
}
