//! End-to-end flow over the in-memory backends: collect → compare →
//! notify, driven through the worker dispatch exactly as production runs
//! it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use marketwatch_backend::config::Config;
use marketwatch_backend::context::AppContext;
use marketwatch_backend::error::ScrapeError;
use marketwatch_backend::kv::MemoryKv;
use marketwatch_backend::metrics::Metrics;
use marketwatch_backend::models::{ChannelKind, User};
use marketwatch_backend::notify::channels::{ChannelResult, NotificationChannel};
use marketwatch_backend::notify::NotificationManager;
use marketwatch_backend::scraper::{ProductKind, ProductScraper, ScrapedDetails};
use marketwatch_backend::storage::{CompetitorScrapedInfo, Database};
use marketwatch_backend::tasks::queue::{
    TaskEnvelope, LANE_MONITOR, LANE_SCRAPING, TASK_COLLECT_COMPETITOR, TASK_COLLECT_PRODUCT,
};
use marketwatch_backend::tasks::worker::handle_task;

struct ScriptedScraper {
    responses: Mutex<Vec<ScrapedDetails>>,
}

#[async_trait]
impl ProductScraper for ScriptedScraper {
    async fn parse(&self, _url: &str, _kind: ProductKind) -> Result<ScrapedDetails, ScrapeError> {
        self.responses
            .lock()
            .pop()
            .ok_or_else(|| ScrapeError::TransientRemote("script exhausted".into()))
    }
}

struct RecordingChannel {
    kind: ChannelKind,
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, _user: &User, subject: &str, message: &str) -> ChannelResult {
        self.sent.lock().push((subject.to_string(), message.to_string()));
        Ok(Some(json!({"ok": true})))
    }
}

fn details(name: &str, price: f64) -> ScrapedDetails {
    ScrapedDetails {
        name: Some(name.to_string()),
        current_price: price,
        old_price: None,
        thumbnail: None,
        free_shipping: false,
        seller: None,
        shipping: None,
    }
}

fn build_ctx(
    responses: Vec<ScrapedDetails>,
) -> (Arc<AppContext>, Arc<Mutex<Vec<(String, String)>>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.audit_dir = dir.path().to_string_lossy().to_string();
    let cfg = Arc::new(cfg);

    let kv = Arc::new(MemoryKv::new());
    let db = Database::open_in_memory().unwrap();
    let metrics = Arc::new(Metrics::new());
    let scraper = Arc::new(ScriptedScraper {
        responses: Mutex::new(responses),
    });

    let mut ctx = AppContext::with_metrics(cfg, kv, db, scraper, metrics.clone());

    let sent = Arc::new(Mutex::new(Vec::new()));
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        Arc::new(RecordingChannel {
            kind: ChannelKind::Email,
            sent: sent.clone(),
        }),
        Arc::new(RecordingChannel {
            kind: ChannelKind::Sms,
            sent: sent.clone(),
        }),
    ];
    ctx.notifier = Arc::new(NotificationManager::new(channels, metrics));

    (Arc::new(ctx), sent, dir)
}

async fn drain_monitor_lane(ctx: &Arc<AppContext>) {
    while let Ok(Some(task)) = ctx.queue.pop(LANE_MONITOR).await {
        handle_task(ctx, &task).await.unwrap();
    }
}

#[tokio::test]
async fn test_collect_compare_notify_flow() {
    // The competitor undercuts the 100.00 target: one price-target alert
    // must reach both channels.
    let (ctx, sent, _dir) = build_ctx(vec![details("rival listing", 80.0), details("notebook", 150.0)]);

    let user = User {
        id: Uuid::new_v4(),
        email: Some("owner@example.com".into()),
        phone: Some("+551199990000".into()),
        whatsapp_number: None,
        fcm_token: None,
        notifications_enabled: true,
        created_at: Utc::now(),
    };
    ctx.db.create_user(&user).unwrap();

    // 1. Collect the monitored product.
    let collect = TaskEnvelope::new(
        TASK_COLLECT_PRODUCT,
        LANE_SCRAPING,
        json!({
            "url": "https://produto.mercadolivre.com.br/MLB-100",
            "user_id": user.id,
            "name": "notebook",
            "target_price": 100.0,
        }),
    );
    handle_task(&ctx, &collect).await.unwrap();

    let products = ctx
        .db
        .list_monitored_by_type(marketwatch_backend::models::MonitoringType::Scraping)
        .unwrap();
    assert_eq!(products.len(), 1);
    let product = &products[0];
    assert_eq!(product.current_price, Some(dec!(150)));

    // 2. Collect a competitor for it.
    let collect_competitor = TaskEnvelope::new(
        TASK_COLLECT_COMPETITOR,
        LANE_SCRAPING,
        json!({
            "monitored_product_id": product.id,
            "url": "https://produto.mercadolivre.com.br/MLB-200",
        }),
    );
    handle_task(&ctx, &collect_competitor).await.unwrap();

    let competitors = ctx.db.list_competitors(product.id).unwrap();
    assert_eq!(competitors.len(), 1);
    assert_eq!(competitors[0].current_price, Some(dec!(80)));

    // 3. Drain the monitor lane: comparisons run, alerts fan out.
    drain_monitor_lane(&ctx).await;

    let comparisons = ctx.db.latest_comparisons(product.id, 10).unwrap();
    assert!(!comparisons.is_empty());
    let latest = &comparisons[0];
    assert!(latest
        .data
        .alerts
        .iter()
        .any(|a| a.pct_below_target == Some(dec!(20.00))));

    // Both channels received the alert, subject carries the alert type.
    let messages = sent.lock();
    assert_eq!(messages.len(), 2);
    assert!(messages
        .iter()
        .all(|(subject, _)| subject == "Alerta price target - notebook"));

    // Notification logs recorded per channel.
    let logs = ctx.db.notification_logs_for_user(user.id).unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log.success));

    // The next fetch is parked with an adaptive ETA.
    assert!(
        !ctx.scheduler.should_recheck(&product.id.to_string()).await,
        "next check must be scheduled in the future"
    );
}

#[tokio::test]
async fn test_repeat_comparison_is_suppressed() {
    let (ctx, sent, _dir) = build_ctx(vec![details("notebook", 150.0)]);

    let user = User {
        id: Uuid::new_v4(),
        email: Some("owner@example.com".into()),
        phone: None,
        whatsapp_number: None,
        fcm_token: None,
        notifications_enabled: true,
        created_at: Utc::now(),
    };
    ctx.db.create_user(&user).unwrap();

    let collect = TaskEnvelope::new(
        TASK_COLLECT_PRODUCT,
        LANE_SCRAPING,
        json!({
            "url": "https://produto.mercadolivre.com.br/MLB-100",
            "user_id": user.id,
            "name": "notebook",
            "target_price": 100.0,
        }),
    );
    handle_task(&ctx, &collect).await.unwrap();
    let product = ctx
        .db
        .list_monitored_by_type(marketwatch_backend::models::MonitoringType::Scraping)
        .unwrap()
        .remove(0);

    ctx.db
        .upsert_competitor_scraped(
            product.id,
            "https://produto.mercadolivre.com.br/MLB-200",
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

    // The comparison chained by the collect task notifies once.
    drain_monitor_lane(&ctx).await;
    let first_round = sent.lock().len();
    assert!(first_round >= 1);

    let compare = TaskEnvelope::new(
        "compare_prices_task",
        LANE_MONITOR,
        json!({"monitored_product_id": product.id}),
    );

    // Second identical comparison shortly after: the rule cooldown
    // suppresses any new notification.
    handle_task(&ctx, &compare).await.unwrap();
    drain_monitor_lane(&ctx).await;
    assert_eq!(sent.lock().len(), first_round);
    assert_eq!(ctx.metrics.alert_rules_suppressed_total.get("cooldown"), 1);
}
