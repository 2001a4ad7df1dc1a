//! Worker pool draining the broker lanes.
//!
//! Each lane gets its own set of tokio tasks; the scraping lane is bounded
//! by the configured concurrency. Handlers are hard-limited to 60 seconds,
//! and every execution feeds the task counters and duration histogram.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::tasks::queue::{
    TaskEnvelope, LANE_MONITOR, LANE_SCRAPING, TASK_COLLECT_COMPETITOR, TASK_COLLECT_PRODUCT,
    TASK_COMPARE_PRICES, TASK_DISPATCH_PRICE_ALERT, TASK_SEND_ALERT, TASK_SEND_NOTIFICATION,
};
use crate::tasks::{alerts, scrape};

const HARD_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Routes an envelope to its handler.
pub async fn handle_task(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    match envelope.name.as_str() {
        TASK_COLLECT_PRODUCT => scrape::collect_product(ctx, envelope).await,
        TASK_COLLECT_COMPETITOR => scrape::collect_competitor(ctx, envelope).await,
        TASK_COMPARE_PRICES => alerts::compare_prices_task(ctx, envelope).await,
        TASK_SEND_NOTIFICATION | TASK_DISPATCH_PRICE_ALERT => {
            alerts::send_notification_task(ctx, envelope).await
        }
        TASK_SEND_ALERT => alerts::send_alert_task(ctx, envelope).await,
        other => {
            warn!(task = other, "unknown task name, dropping");
            Ok(())
        }
    }
}

async fn run_one(ctx: &AppContext, envelope: TaskEnvelope) {
    let start = Instant::now();
    let name = envelope.name.clone();

    let result = tokio::time::timeout(HARD_TIMEOUT, handle_task(ctx, &envelope)).await;
    let status = match result {
        Ok(Ok(())) => "success",
        Ok(Err(err)) => {
            error!(task = %name, error = %err, "task failed");
            "failure"
        }
        Err(_) => {
            error!(task = %name, "task hit the hard timeout");
            "failure"
        }
    };

    ctx.metrics
        .tasks_total
        .inc(&format!("{}_{}", name, status));
    ctx.metrics
        .task_duration_seconds
        .observe(start.elapsed().as_secs_f64());
}

async fn worker_loop(ctx: Arc<AppContext>, lane: &'static str) {
    loop {
        // Promote any delayed task that became due.
        if let Err(err) = ctx.queue.promote_due().await {
            warn!(error = %err, "promoting delayed tasks failed");
        }

        match ctx.queue.pop(lane).await {
            Ok(Some(envelope)) => run_one(&ctx, envelope).await,
            Ok(None) => tokio::time::sleep(IDLE_POLL).await,
            Err(err) => {
                // Broker unreachable; back off before polling again.
                error!(lane, error = %err, "queue pop failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Spawns the per-lane worker pools.
pub fn spawn_workers(ctx: Arc<AppContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let scraping_workers = ctx.cfg.worker_concurrency.max(1);
    let monitor_workers = ctx.cfg.worker_concurrency.max(1);

    info!(
        scraping = scraping_workers,
        monitor = monitor_workers,
        "starting worker pools"
    );
    for _ in 0..scraping_workers {
        handles.push(tokio::spawn(worker_loop(ctx.clone(), LANE_SCRAPING)));
    }
    for _ in 0..monitor_workers {
        handles.push(tokio::spawn(worker_loop(ctx.clone(), LANE_MONITOR)));
    }
    handles
}
