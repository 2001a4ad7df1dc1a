//! Comparison and notification tasks on the monitor lane.

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::compare::compare_prices;
use crate::context::AppContext;
use crate::models::AlertCandidate;
use crate::notify::dispatch_price_alerts;
use crate::tasks::queue::{TaskEnvelope, LANE_MONITOR, TASK_SEND_NOTIFICATION};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareArgs {
    pub monitored_product_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNotificationArgs {
    pub monitored_product_id: Uuid,
    pub alerts: Vec<AlertCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAlertArgs {
    pub notification_log_id: Uuid,
}

/// Loads the product and its competitors, runs the comparison, persists
/// the snapshot and hands alerts to the notification task.
pub async fn compare_prices_task(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    let start = Instant::now();
    let args: CompareArgs =
        serde_json::from_value(envelope.args.clone()).context("invalid compare payload")?;

    let product = ctx
        .db
        .get_monitored(args.monitored_product_id)?
        .with_context(|| format!("monitored product {} not found", args.monitored_product_id))?;
    let competitors = ctx.db.list_competitors(product.id)?;

    let result = compare_prices(
        &product,
        &competitors,
        ctx.cfg.price_tolerance,
        Some(ctx.cfg.price_change_threshold),
    );

    ctx.db.insert_comparison(product.id, &result)?;
    let _ = ctx
        .kv
        .set_ex(
            &format!("compare:last_success:{}", product.id),
            &Utc::now().to_rfc3339(),
            ctx.cfg.comparison_last_success_ttl,
        )
        .await;

    info!(
        monitored_id = %product.id,
        competitors = competitors.len(),
        alerts = result.alerts.len(),
        "price comparison completed"
    );

    if !result.alerts.is_empty() {
        let args = SendNotificationArgs {
            monitored_product_id: product.id,
            alerts: result.alerts.clone(),
        };
        let notify = TaskEnvelope::new(
            TASK_SEND_NOTIFICATION,
            LANE_MONITOR,
            serde_json::to_value(&args)?,
        );
        ctx.queue.enqueue(&notify).await?;
    }

    ctx.metrics
        .scraping_latency_seconds
        .observe(start.elapsed().as_secs_f64());
    Ok(())
}

/// Fans alerts out to every configured channel for the product's owner.
pub async fn send_notification_task(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    let args: SendNotificationArgs =
        serde_json::from_value(envelope.args.clone()).context("invalid notification payload")?;

    let product = ctx
        .db
        .get_monitored(args.monitored_product_id)?
        .with_context(|| format!("monitored product {} not found", args.monitored_product_id))?;

    dispatch_price_alerts(
        &ctx.db,
        &ctx.cfg,
        &ctx.metrics,
        &ctx.notifier,
        &product,
        &args.alerts,
    )
    .await
}

/// Re-sends a previously logged notification through its original channel.
pub async fn send_alert_task(ctx: &AppContext, envelope: &TaskEnvelope) -> Result<()> {
    let args: SendAlertArgs =
        serde_json::from_value(envelope.args.clone()).context("invalid alert payload")?;

    let log = ctx
        .db
        .get_notification_log(args.notification_log_id)?
        .with_context(|| format!("notification log {} not found", args.notification_log_id))?;
    let user = ctx
        .db
        .get_user(log.user_id)?
        .with_context(|| format!("user {} not found", log.user_id))?;

    let delivered = ctx
        .notifier
        .send_via(
            &ctx.db,
            log.channel,
            &user,
            &log.subject,
            &log.message,
            log.alert_rule_id,
            log.alert_type,
        )
        .await;
    if !delivered {
        warn!(channel = log.channel.as_str(), "resend channel unavailable");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::MemoryKv;
    use crate::models::User;
    use crate::scraper::client::DisabledScraper;
    use crate::storage::{CompetitorScrapedInfo, Database, MonitoredScrapedInfo};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn ctx() -> (AppContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.audit_dir = dir.path().to_string_lossy().to_string();
        let ctx = AppContext::new(
            Arc::new(cfg),
            Arc::new(MemoryKv::new()),
            Database::open_in_memory().unwrap(),
            Arc::new(DisabledScraper),
        );
        (ctx, dir)
    }

    fn seed(ctx: &AppContext) -> (User, crate::models::MonitoredProduct) {
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
        let product = ctx
            .db
            .upsert_monitored_scraped(
                user.id,
                "notebook",
                "https://produto.mercadolivre.com.br/MLB-1",
                Some(dec!(100.00)),
                &MonitoredScrapedInfo {
                    current_price: dec!(150.00),
                    thumbnail: None,
                    free_shipping: false,
                },
                Utc::now(),
            )
            .unwrap();
        (user, product)
    }

    #[tokio::test]
    async fn test_compare_persists_snapshot_and_chains_notification() {
        let (ctx, _dir) = ctx();
        let (_user, product) = seed(&ctx);
        ctx.db
            .upsert_competitor_scraped(
                product.id,
                "https://produto.mercadolivre.com.br/MLB-2",
                &CompetitorScrapedInfo {
                    name: "rival".into(),
                    current_price: dec!(80.00),
                    old_price: None,
                    thumbnail: None,
                    free_shipping: false,
                    seller: None,
                },
                Utc::now(),
            )
            .unwrap();

        let envelope = TaskEnvelope::new(
            "compare_prices_task",
            LANE_MONITOR,
            serde_json::to_value(CompareArgs {
                monitored_product_id: product.id,
            })
            .unwrap(),
        );
        compare_prices_task(&ctx, &envelope).await.unwrap();

        let comparisons = ctx.db.latest_comparisons(product.id, 10).unwrap();
        assert_eq!(comparisons.len(), 1);
        assert!(!comparisons[0].data.alerts.is_empty());

        // 80 < 100 - 0.01: the below-target alert chains a send task.
        let notify = ctx.queue.pop(LANE_MONITOR).await.unwrap().unwrap();
        assert_eq!(notify.name, TASK_SEND_NOTIFICATION);

        // last-success stamp with TTL.
        let ttl = ctx
            .kv
            .ttl(&format!("compare:last_success:{}", product.id))
            .await
            .unwrap();
        assert!(ttl > 0);
    }

    #[tokio::test]
    async fn test_compare_without_alerts_sends_nothing() {
        let (ctx, _dir) = ctx();
        let (_user, product) = seed(&ctx);
        // Competitor priced well above target, no previous price.
        ctx.db
            .upsert_competitor_scraped(
                product.id,
                "https://produto.mercadolivre.com.br/MLB-2",
                &CompetitorScrapedInfo {
                    name: "rival".into(),
                    current_price: dec!(500.00),
                    old_price: None,
                    thumbnail: None,
                    free_shipping: false,
                    seller: None,
                },
                Utc::now(),
            )
            .unwrap();

        let envelope = TaskEnvelope::new(
            "compare_prices_task",
            LANE_MONITOR,
            serde_json::to_value(CompareArgs {
                monitored_product_id: product.id,
            })
            .unwrap(),
        );
        compare_prices_task(&ctx, &envelope).await.unwrap();

        assert!(ctx.queue.pop(LANE_MONITOR).await.unwrap().is_none());
        assert_eq!(ctx.db.latest_comparisons(product.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compare_twice_produces_identical_payloads() {
        let (ctx, _dir) = ctx();
        let (_user, product) = seed(&ctx);
        ctx.db
            .upsert_competitor_scraped(
                product.id,
                "https://produto.mercadolivre.com.br/MLB-2",
                &CompetitorScrapedInfo {
                    name: "rival".into(),
                    current_price: dec!(80.00),
                    old_price: None,
                    thumbnail: None,
                    free_shipping: false,
                    seller: None,
                },
                Utc::now(),
            )
            .unwrap();

        let envelope = TaskEnvelope::new(
            "compare_prices_task",
            LANE_MONITOR,
            serde_json::to_value(CompareArgs {
                monitored_product_id: product.id,
            })
            .unwrap(),
        );
        compare_prices_task(&ctx, &envelope).await.unwrap();
        compare_prices_task(&ctx, &envelope).await.unwrap();

        let comparisons = ctx.db.latest_comparisons(product.id, 10).unwrap();
        assert_eq!(comparisons.len(), 2);
        assert_eq!(
            serde_json::to_value(&comparisons[0].data).unwrap(),
            serde_json::to_value(&comparisons[1].data).unwrap()
        );
    }

    #[tokio::test]
    async fn test_compare_missing_product_errors() {
        let (ctx, _dir) = ctx();
        let envelope = TaskEnvelope::new(
            "compare_prices_task",
            LANE_MONITOR,
            serde_json::to_value(CompareArgs {
                monitored_product_id: Uuid::new_v4(),
            })
            .unwrap(),
        );
        assert!(compare_prices_task(&ctx, &envelope).await.is_err());
    }
}
