//! HTTP surface of the alert service: health, metrics and the product
//! intake endpoint that feeds the collection queue.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::context::AppContext;
use crate::scraper::urls::canonicalize_ml_url;
use crate::tasks::queue::{TaskEnvelope, LANE_SCRAPING, TASK_COLLECT_PRODUCT};
use crate::tasks::scrape::CollectProductArgs;

const BEAT_LAG_TOLERANCE_SECS: i64 = 300;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health/", get(health))
        .route("/metrics", get(metrics))
        .route("/products", post(create_product))
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let mut overall = "ok";

    let database = match ctx.db.health_check() {
        Ok(()) => json!({ "status": "ok" }),
        Err(err) => {
            overall = "error";
            json!({ "status": "error", "detail": err.to_string() })
        }
    };

    let redis = match ctx.kv.ping().await {
        Ok(()) => json!({ "status": "ok" }),
        Err(err) => {
            overall = "error";
            json!({ "status": "error", "detail": err.to_string() })
        }
    };

    let beat = match ctx.kv.get("beat:last_success").await {
        Ok(Some(raw)) => match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => {
                let lag = (Utc::now() - ts.with_timezone(&Utc)).num_seconds();
                let status = if lag <= BEAT_LAG_TOLERANCE_SECS { "ok" } else { "stale" };
                if status != "ok" {
                    overall = "error";
                }
                json!({
                    "status": status,
                    "last_success": ts.to_rfc3339(),
                    "lag_seconds": lag,
                })
            }
            Err(_) => {
                overall = "error";
                json!({ "status": "error", "detail": "unparseable heartbeat" })
            }
        },
        Ok(None) => {
            overall = "error";
            json!({ "status": "missing" })
        }
        Err(err) => {
            overall = "error";
            json!({ "status": "error", "detail": err.to_string() })
        }
    };

    Json(json!({
        "overall": overall,
        "database": database,
        "redis": redis,
        "beat": beat,
    }))
}

async fn metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    ctx.metrics.to_prometheus()
}

#[derive(Debug, Deserialize)]
struct CreateProductRequest {
    url: String,
    user_id: Uuid,
    name: String,
    #[serde(default)]
    target_price: f64,
}

/// Validates the URL and queues the first collection. The canonical form
/// becomes the product's uniqueness key.
async fn create_product(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<CreateProductRequest>,
) -> impl IntoResponse {
    let Some(canonical) = canonicalize_ml_url(&request.url) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("not a marketplace product URL: {}", request.url) })),
        )
            .into_response();
    };

    let args = CollectProductArgs {
        url: canonical.clone(),
        user_id: request.user_id,
        name: request.name,
        target_price: request.target_price,
        monitored_id: None,
    };
    let envelope = TaskEnvelope::new(
        TASK_COLLECT_PRODUCT,
        LANE_SCRAPING,
        serde_json::to_value(&args).unwrap_or_default(),
    );
    if let Err(err) = ctx.queue.enqueue(&envelope).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": format!("queue unavailable: {}", err) })),
        )
            .into_response();
    }

    info!(url = %canonical, user_id = %request.user_id, "product collection queued");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "url": canonical, "queued": true })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kv::MemoryKv;
    use crate::scraper::client::DisabledScraper;
    use crate::storage::Database;

    fn ctx() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.audit_dir = dir.path().to_string_lossy().to_string();
        let ctx = AppContext::new(
            Arc::new(cfg),
            Arc::new(MemoryKv::new()),
            Database::open_in_memory().unwrap(),
            Arc::new(DisabledScraper),
        );
        (Arc::new(ctx), dir)
    }

    #[tokio::test]
    async fn test_health_reports_missing_beat() {
        let (ctx, _dir) = ctx();
        let response = health(State(ctx)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["overall"], "error");
        assert_eq!(parsed["database"]["status"], "ok");
        assert_eq!(parsed["redis"]["status"], "ok");
        assert_eq!(parsed["beat"]["status"], "missing");
    }

    #[tokio::test]
    async fn test_health_ok_with_fresh_beat() {
        let (ctx, _dir) = ctx();
        ctx.kv
            .set("beat:last_success", &Utc::now().to_rfc3339())
            .await
            .unwrap();
        let response = health(State(ctx)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["overall"], "ok");
        assert_eq!(parsed["beat"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_health_flags_stale_beat() {
        let (ctx, _dir) = ctx();
        let stale = Utc::now() - chrono::Duration::seconds(900);
        ctx.kv
            .set("beat:last_success", &stale.to_rfc3339())
            .await
            .unwrap();
        let response = health(State(ctx)).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["overall"], "error");
        assert_eq!(parsed["beat"]["status"], "stale");
    }

    #[tokio::test]
    async fn test_create_product_rejects_bad_url() {
        let (ctx, _dir) = ctx();
        let request = CreateProductRequest {
            url: "https://example.com/thing".into(),
            user_id: Uuid::new_v4(),
            name: "x".into(),
            target_price: 10.0,
        };
        let response = create_product(State(ctx.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ctx.queue.depth(LANE_SCRAPING).await, 0);
    }

    #[tokio::test]
    async fn test_create_product_queues_canonical_url() {
        let (ctx, _dir) = ctx();
        let request = CreateProductRequest {
            url: "https://www.mercadolivre.com.br/notebook/MLB123456?src=search".into(),
            user_id: Uuid::new_v4(),
            name: "notebook".into(),
            target_price: 100.0,
        };
        let response = create_product(State(ctx.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let task = ctx.queue.pop(LANE_SCRAPING).await.unwrap().unwrap();
        assert_eq!(task.name, TASK_COLLECT_PRODUCT);
        assert_eq!(
            task.args["url"],
            "https://produto.mercadolivre.com.br/MLB-123456"
        );
    }
}
