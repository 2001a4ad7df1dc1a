//! Periodic maintenance tasks: queue/store gauges and cache cleanup.

use anyhow::Result;
use tracing::{error, info};

use crate::context::AppContext;
use crate::tasks::queue::{LANE_MONITOR, LANE_SCRAPING};

/// Queue depths per lane for the Prometheus gauges.
pub async fn collect_queue_metrics(ctx: &AppContext) -> Result<()> {
    for lane in [LANE_SCRAPING, LANE_MONITOR] {
        let depth = ctx.queue.depth(lane).await;
        ctx.metrics.set_queue_length(lane, depth);
    }
    Ok(())
}

/// Audit record counts per stage.
pub async fn collect_audit_metrics(ctx: &AppContext) -> Result<()> {
    let counts = ctx.audit.count_by_stage();
    for (stage, count) in &counts {
        info!(stage = %stage, count, "audit records on disk");
    }
    Ok(())
}

/// Row counts per table.
pub async fn collect_db_metrics(ctx: &AppContext) -> Result<()> {
    match ctx.db.table_counts() {
        Ok(counts) => {
            for (table, rows) in counts {
                ctx.metrics.set_db_rows(&table, rows);
            }
        }
        Err(err) => error!(error = %err, "failed collecting database metrics"),
    }
    Ok(())
}

/// Daily sweep for cache entries written without a TTL.
pub async fn cleanup_cache(ctx: &AppContext) -> Result<usize> {
    let removed = ctx.cache.cleanup().await;
    info!(removed, "cache cleanup finished");
    Ok(removed)
}
