//! Collection tasks for monitored and competitor products.
//!
//! Each handler applies the protection gates (global suspend, circuit,
//! per-task rate limit), validates its payload, calls the scraper service,
//! persists, and always reschedules the product's next fetch before
//! returning.

use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::ScrapeError;
use crate::kv::is_scraping_suspended;
use crate::models::ComparisonResult;
use crate::ratelimit::RateLimiter;
use crate::scraper::urls::canonicalize_ml_url;
use crate::scraper::ProductKind;
use crate::storage::{CompetitorScrapedInfo, MonitoredScrapedInfo};
use crate::tasks::queue::{
    TaskEnvelope, LANE_MONITOR, LANE_SCRAPING, TASK_COLLECT_COMPETITOR, TASK_COLLECT_PRODUCT,
    TASK_COMPARE_PRICES,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectProductArgs {
    pub url: String,
    pub user_id: Uuid,
    pub name: String,
    pub target_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitored_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectCompetitorArgs {
    pub monitored_product_id: Uuid,
    pub url: String,
}

fn task_rate_limiter(ctx: &AppContext, task_name: &str, rate: &str) -> RateLimiter {
    let (limit, window) = crate::config::parse_rate_limit(rate).unwrap_or((10, 60));
    RateLimiter::new(ctx.kv.clone(), format!("rate:{}", task_name), limit, window)
}

/// Loads the latest comparison payloads feeding the adaptive scheduler.
fn recent_comparisons(ctx: &AppContext, monitored_id: Uuid) -> Vec<ComparisonResult> {
    ctx.db
        .latest_comparisons(monitored_id, 3)
        .map(|comps| comps.into_iter().map(|c| c.data).collect())
        .unwrap_or_default()
}

/// Schedules the product's next collection and parks the task at its ETA.
async fn reschedule_product(ctx: &AppContext, monitored_id: Uuid) {
    let Ok(Some(product)) = ctx.db.get_monitored(monitored_id) else {
        return;
    };
    let comparisons = recent_comparisons(ctx, monitored_id);
    let eta = ctx.scheduler.schedule_next(&product, &comparisons).await;

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
        serde_json::to_value(&args).unwrap_or_default(),
    );
    if let Err(err) = ctx.queue.enqueue_at(&envelope, eta).await {
        warn!(monitored_id = %monitored_id, error = %err, "failed scheduling next fetch");
    }
}

/// Same for a competitor URL: next occurrence at the adaptive ETA.
async fn reschedule_competitor(ctx: &AppContext, monitored_id: Uuid, url: &str) {
    let Ok(Some(product)) = ctx.db.get_monitored(monitored_id) else {
        return;
    };
    let comparisons = recent_comparisons(ctx, monitored_id);
    let eta = ctx.scheduler.schedule_next(&product, &comparisons).await;

    let args = CollectCompetitorArgs {
        monitored_product_id: monitored_id,
        url: url.to_string(),
    };
    let envelope = TaskEnvelope::new(
        TASK_COLLECT_COMPETITOR,
        LANE_SCRAPING,
        serde_json::to_value(&args).unwrap_or_default(),
    );
    if let Err(err) = ctx.queue.enqueue_at(&envelope, eta).await {
        warn!(monitored_id = %monitored_id, error = %err, "failed scheduling next competitor fetch");
    }
}

/// Requeues a transient failure with bounded backoff.
async fn retry_later(ctx: &AppContext, envelope: &TaskEnvelope) {
    if envelope.attempt >= ctx.cfg.task_max_retries {
        warn!(task = %envelope.name, attempt = envelope.attempt, "retries exhausted");
        return;
    }
    let eta = Utc::now() + chrono::Duration::seconds(ctx.cfg.task_retry_delay_secs);
    if let Err(err) = ctx.queue.enqueue_at(&envelope.retry(), eta).await {
        warn!(task = %envelope.name, error = %err, "failed enqueueing retry");
    }
}

/// Collects one monitored product via the scraper service.
pub async fn collect_product(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    ctx.metrics.scraper_in_flight.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();
    let result = collect_product_inner(ctx, envelope).await;
    ctx.metrics
        .scraping_latency_seconds
        .observe(start.elapsed().as_secs_f64());
    ctx.metrics.scraper_in_flight.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn collect_product_inner(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    if is_scraping_suspended(ctx.kv.as_ref(), &ctx.metrics).await {
        warn!(task = %envelope.name, "scraping suspended flag is set");
        return Ok(());
    }
    if !ctx.circuit.allow_request(TASK_COLLECT_PRODUCT).await {
        error!(task = %envelope.name, "circuit breaker open");
        return Ok(());
    }
    let limiter = task_rate_limiter(ctx, TASK_COLLECT_PRODUCT, &ctx.cfg.scraper_rate_limit);
    if !limiter.allow_request(None).await.unwrap_or(false) {
        warn!(task = %envelope.name, "task rate limit exceeded");
        return Ok(());
    }

    // Invalid payloads exit without retry.
    let args: CollectProductArgs = match serde_json::from_value(envelope.args.clone()) {
        Ok(args) => args,
        Err(err) => {
            error!(task = %envelope.name, error = %err, "invalid payload");
            return Ok(());
        }
    };
    if canonicalize_ml_url(&args.url).is_none() {
        error!(url = %args.url, "payload url is not a marketplace product");
        return Ok(());
    }

    info!(url = %args.url, user_id = %args.user_id, "collect product started");
    let mut product_id = args.monitored_id;

    let outcome = match ctx.scraper.parse(&args.url, ProductKind::Monitored).await {
        Ok(details) => {
            let info = MonitoredScrapedInfo {
                current_price: details.current_price_decimal(),
                thumbnail: details.thumbnail.clone(),
                free_shipping: details.free_shipping,
            };
            let target = rust_decimal::prelude::FromPrimitive::from_f64(args.target_price);
            match ctx.db.upsert_monitored_scraped(
                args.user_id,
                &args.name,
                &args.url,
                target,
                &info,
                Utc::now(),
            ) {
                Ok(product) => {
                    product_id = Some(product.id);
                    ctx.audit.record(
                        "persist",
                        &args.url,
                        json!({"user_id": args.user_id}),
                        None,
                        Some(json!({"product_id": product.id, "current_price": details.current_price})),
                        None,
                    );

                    let compare = TaskEnvelope::new(
                        TASK_COMPARE_PRICES,
                        LANE_MONITOR,
                        json!({"monitored_product_id": product.id}),
                    );
                    if let Err(err) = ctx.queue.enqueue(&compare).await {
                        warn!(error = %err, "failed enqueueing comparison");
                    }

                    let _ = ctx
                        .kv
                        .set("beat:last_success", &Utc::now().to_rfc3339())
                        .await;
                    let _ = ctx.circuit.record_success(TASK_COLLECT_PRODUCT).await;
                    ctx.scheduler
                        .record_result(&product.id.to_string(), true)
                        .await;
                    info!(product_id = %product.id, "collect product completed");
                    Ok(())
                }
                Err(err) => Err(ScrapeError::DependencyUnavailable(format!(
                    "persist failed: {}",
                    err
                ))),
            }
        }
        Err(err) => Err(err),
    };

    let result = match outcome {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(url = %args.url, error = %err, "collect product failed");
            let _ = ctx.circuit.record_failure(TASK_COLLECT_PRODUCT).await;
            if let Some(id) = product_id {
                ctx.scheduler.record_result(&id.to_string(), false).await;
                if let Err(db_err) = ctx.db.insert_scraping_error(
                    id,
                    &args.url,
                    None,
                    err.error_type(),
                    &err.to_string(),
                ) {
                    warn!(error = %db_err, "failed persisting scraping error");
                }
            }
            if err.is_retryable() {
                retry_later(ctx, envelope).await;
            }
            Err(err.into())
        }
    };

    // The next occurrence is always scheduled, success or failure.
    if let Some(id) = product_id {
        reschedule_product(ctx, id).await;
    }
    result
}

/// Collects one competitor listing and triggers a price comparison.
pub async fn collect_competitor(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    ctx.metrics.scraper_in_flight.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();
    let result = collect_competitor_inner(ctx, envelope).await;
    ctx.metrics
        .scraping_latency_seconds
        .observe(start.elapsed().as_secs_f64());
    ctx.metrics.scraper_in_flight.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn collect_competitor_inner(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    if is_scraping_suspended(ctx.kv.as_ref(), &ctx.metrics).await {
        warn!(task = %envelope.name, "scraping suspended flag is set");
        return Ok(());
    }
    if !ctx.circuit.allow_request(TASK_COLLECT_COMPETITOR).await {
        error!(task = %envelope.name, "circuit breaker open");
        return Ok(());
    }
    let limiter = task_rate_limiter(ctx, TASK_COLLECT_COMPETITOR, &ctx.cfg.competitor_rate_limit);
    if !limiter.allow_request(None).await.unwrap_or(false) {
        warn!(task = %envelope.name, "task rate limit exceeded");
        return Ok(());
    }

    let args: CollectCompetitorArgs = match serde_json::from_value(envelope.args.clone()) {
        Ok(args) => args,
        Err(err) => {
            error!(task = %envelope.name, error = %err, "invalid payload");
            return Ok(());
        }
    };
    if canonicalize_ml_url(&args.url).is_none() {
        error!(url = %args.url, "payload url is not a marketplace product");
        return Ok(());
    }

    info!(
        monitored_id = %args.monitored_product_id,
        url = %args.url,
        "collect competitor started"
    );

    let outcome = match ctx.scraper.parse(&args.url, ProductKind::Competitor).await {
        Ok(details) => {
            let info = CompetitorScrapedInfo {
                name: details.name.clone().unwrap_or_default(),
                current_price: details.current_price_decimal(),
                old_price: details.old_price_decimal(),
                thumbnail: details.thumbnail.clone(),
                free_shipping: details.free_shipping,
                seller: details.seller.clone(),
            };
            match ctx.db.upsert_competitor_scraped(
                args.monitored_product_id,
                &args.url,
                &info,
                Utc::now(),
            ) {
                Ok(competitor) => {
                    ctx.audit.record(
                        "persist",
                        &args.url,
                        json!({"monitored_product_id": args.monitored_product_id}),
                        None,
                        Some(json!({"competitor_id": competitor.id, "current_price": details.current_price})),
                        None,
                    );

                    let compare = TaskEnvelope::new(
                        TASK_COMPARE_PRICES,
                        LANE_MONITOR,
                        json!({"monitored_product_id": args.monitored_product_id}),
                    );
                    if let Err(err) = ctx.queue.enqueue(&compare).await {
                        warn!(error = %err, "failed enqueueing comparison");
                    }

                    let _ = ctx.circuit.record_success(TASK_COLLECT_COMPETITOR).await;
                    ctx.scheduler
                        .record_result(&args.monitored_product_id.to_string(), true)
                        .await;
                    info!(competitor_id = %competitor.id, "collect competitor completed");
                    Ok(())
                }
                Err(err) => Err(ScrapeError::DependencyUnavailable(format!(
                    "persist failed: {}",
                    err
                ))),
            }
        }
        Err(err) => Err(err),
    };

    let result = match outcome {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(url = %args.url, error = %err, "collect competitor failed");
            let _ = ctx.circuit.record_failure(TASK_COLLECT_COMPETITOR).await;
            ctx.scheduler
                .record_result(&args.monitored_product_id.to_string(), false)
                .await;
            if let Err(db_err) = ctx.db.insert_scraping_error(
                args.monitored_product_id,
                &args.url,
                None,
                err.error_type(),
                &err.to_string(),
            ) {
                warn!(error = %db_err, "failed persisting scraping error");
            }
            if err.is_retryable() {
                retry_later(ctx, envelope).await;
            }
            Err(err.into())
        }
    };

    reschedule_competitor(ctx, args.monitored_product_id, &args.url).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::MemoryKv;
    use crate::models::User;
    use crate::scraper::{ProductScraper, ScrapedDetails};
    use crate::storage::Database;
    use crate::tasks::queue::LANE_MONITOR;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct StubScraper {
        responses: Mutex<Vec<Result<ScrapedDetails, ScrapeError>>>,
    }

    #[async_trait]
    impl ProductScraper for StubScraper {
        async fn parse(&self, _url: &str, _kind: ProductKind) -> Result<ScrapedDetails, ScrapeError> {
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(ScrapeError::TransientRemote("no stubbed response".into())))
        }
    }

    fn details(price: f64) -> ScrapedDetails {
        ScrapedDetails {
            name: Some("rival listing".into()),
            current_price: price,
            old_price: None,
            thumbnail: None,
            free_shipping: false,
            seller: Some("store".into()),
            shipping: None,
        }
    }

    fn ctx_with(responses: Vec<Result<ScrapedDetails, ScrapeError>>) -> (AppContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.audit_dir = dir.path().to_string_lossy().to_string();
        let kv = Arc::new(MemoryKv::new());
        let db = Database::open_in_memory().unwrap();
        let scraper = Arc::new(StubScraper {
            responses: Mutex::new(responses),
        });
        (AppContext::new(Arc::new(cfg), kv, db, scraper), dir)
    }

    fn seed_user(ctx: &AppContext) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: None,
            phone: None,
            whatsapp_number: None,
            fcm_token: None,
            notifications_enabled: true,
            created_at: Utc::now(),
        };
        ctx.db.create_user(&user).unwrap();
        user
    }

    fn product_envelope(user_id: Uuid) -> TaskEnvelope {
        TaskEnvelope::new(
            TASK_COLLECT_PRODUCT,
            LANE_SCRAPING,
            serde_json::to_value(CollectProductArgs {
                url: "https://produto.mercadolivre.com.br/MLB-111".into(),
                user_id,
                name: "notebook".into(),
                target_price: 100.0,
                monitored_id: None,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_collect_product_success_persists_and_chains() {
        let (ctx, _dir) = ctx_with(vec![Ok(details(90.0))]);
        let user = seed_user(&ctx);

        collect_product(&ctx, &product_envelope(user.id)).await.unwrap();

        let products = ctx.db.list_monitored_by_type(crate::models::MonitoringType::Scraping).unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].current_price, Some(dec!(90)));

        // Comparison task enqueued on the monitor lane.
        let compare = ctx.queue.pop(LANE_MONITOR).await.unwrap().unwrap();
        assert_eq!(compare.name, TASK_COMPARE_PRICES);

        // schedule_next stored the recheck time for the new product.
        assert!(
            !ctx.scheduler.should_recheck(&products[0].id.to_string()).await,
            "next check must be in the future"
        );

        // Heartbeat stamped.
        assert!(ctx.kv.get("beat:last_success").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_collect_product_failure_records_error_and_retries() {
        let (ctx, _dir) = ctx_with(vec![Err(ScrapeError::TransientRemote("boom".into()))]);
        let user = seed_user(&ctx);

        // Seed an existing product so the failure path has a product id.
        let product = ctx
            .db
            .upsert_monitored_scraped(
                user.id,
                "notebook",
                "https://produto.mercadolivre.com.br/MLB-111",
                Some(dec!(100)),
                &MonitoredScrapedInfo {
                    current_price: dec!(95),
                    thumbnail: None,
                    free_shipping: false,
                },
                Utc::now(),
            )
            .unwrap();

        let mut envelope = product_envelope(user.id);
        envelope.args["monitored_id"] = serde_json::json!(product.id);

        let result = collect_product(&ctx, &envelope).await;
        assert!(result.is_err());

        // Failure bookkeeping: scheduler counter and scraping error row.
        assert_eq!(ctx.scheduler.failures(&product.id.to_string()).await, 1);
        let counts = ctx.db.table_counts().unwrap();
        let errors = counts.iter().find(|(t, _)| t == "scraping_errors").unwrap();
        assert_eq!(errors.1, 1);

        // A retry was parked; promoting far in the future surfaces it.
        let promoted = promote_all(&ctx).await;
        assert!(
            promoted.iter().any(|t| t.name == TASK_COLLECT_PRODUCT && t.attempt == 1),
            "retry with incremented attempt expected"
        );
    }

    #[tokio::test]
    async fn test_collect_product_invalid_payload_no_retry() {
        let (ctx, _dir) = ctx_with(vec![Ok(details(90.0))]);
        let envelope = TaskEnvelope::new(
            TASK_COLLECT_PRODUCT,
            LANE_SCRAPING,
            serde_json::json!({"url": 42}),
        );
        collect_product(&ctx, &envelope).await.unwrap();
        assert_eq!(promote_all(&ctx).await.len(), 0);
    }

    #[tokio::test]
    async fn test_collect_product_rejects_foreign_url() {
        let (ctx, _dir) = ctx_with(vec![Ok(details(90.0))]);
        let user = seed_user(&ctx);
        let envelope = TaskEnvelope::new(
            TASK_COLLECT_PRODUCT,
            LANE_SCRAPING,
            serde_json::to_value(CollectProductArgs {
                url: "https://example.com/product".into(),
                user_id: user.id,
                name: "x".into(),
                target_price: 0.0,
                monitored_id: None,
            })
            .unwrap(),
        );
        collect_product(&ctx, &envelope).await.unwrap();
        assert!(ctx
            .db
            .list_monitored_by_type(crate::models::MonitoringType::Scraping)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_collect_skips_when_suspended() {
        let (ctx, _dir) = ctx_with(vec![Ok(details(90.0))]);
        let user = seed_user(&ctx);
        crate::kv::suspend_scraping(ctx.kv.as_ref(), &ctx.metrics, 300).await;

        collect_product(&ctx, &product_envelope(user.id)).await.unwrap();
        assert!(ctx
            .db
            .list_monitored_by_type(crate::models::MonitoringType::Scraping)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_collect_competitor_success() {
        let (ctx, _dir) = ctx_with(vec![Ok(details(80.0))]);
        let user = seed_user(&ctx);
        let product = ctx
            .db
            .upsert_monitored_scraped(
                user.id,
                "notebook",
                "https://produto.mercadolivre.com.br/MLB-111",
                Some(dec!(100)),
                &MonitoredScrapedInfo {
                    current_price: dec!(95),
                    thumbnail: None,
                    free_shipping: false,
                },
                Utc::now(),
            )
            .unwrap();

        let envelope = TaskEnvelope::new(
            TASK_COLLECT_COMPETITOR,
            LANE_SCRAPING,
            serde_json::to_value(CollectCompetitorArgs {
                monitored_product_id: product.id,
                url: "https://produto.mercadolivre.com.br/MLB-222".into(),
            })
            .unwrap(),
        );
        collect_competitor(&ctx, &envelope).await.unwrap();

        let competitors = ctx.db.list_competitors(product.id).unwrap();
        assert_eq!(competitors.len(), 1);
        assert_eq!(competitors[0].current_price, Some(dec!(80)));

        let compare = ctx.queue.pop(LANE_MONITOR).await.unwrap().unwrap();
        assert_eq!(compare.name, TASK_COMPARE_PRICES);
    }

    /// Collects every parked task regardless of ETA plus anything already
    /// on the lanes.
    async fn promote_all(ctx: &AppContext) -> Vec<TaskEnvelope> {
        let mut tasks = Vec::new();
        for member in ctx.kv.zpop_due("queue:eta", f64::MAX).await.unwrap_or_default() {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&member) {
                if let Ok(task) = serde_json::from_value::<TaskEnvelope>(value["task"].clone()) {
                    tasks.push(task);
                }
            }
        }
        for lane in [LANE_SCRAPING, LANE_MONITOR] {
            while let Ok(Some(task)) = ctx.queue.pop(lane).await {
                tasks.push(task);
            }
        }
        tasks
    }
}
