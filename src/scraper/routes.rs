//! HTTP surface of the scraper service.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::kv::KvStore;
use crate::metrics::Metrics;

use super::client::ParseRequest;
use super::pipeline::ScraperPipeline;
use super::urls::canonicalize_ml_url;

#[derive(Clone)]
pub struct ScraperState {
    pub pipeline: Arc<ScraperPipeline>,
    pub kv: Arc<dyn KvStore>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: ScraperState) -> Router {
    Router::new()
        .route("/scraper/parse", post(parse_product))
        .route("/health/", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn parse_product(
    State(state): State<ScraperState>,
    Json(request): Json<ParseRequest>,
) -> impl IntoResponse {
    if canonicalize_ml_url(&request.url).is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("not a marketplace product URL: {}", request.url) })),
        )
            .into_response();
    }

    info!(url = %request.url, product_type = ?request.product_type, "parse requested");
    match state.pipeline.scrape(&request.url, request.product_type).await {
        Ok(details) => Json(details).into_response(),
        Err(err) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "detail": err.to_string() }))).into_response()
        }
    }
}

async fn health(State(state): State<ScraperState>) -> impl IntoResponse {
    let mut overall = "ok";
    let redis = match state.kv.ping().await {
        Ok(()) => json!({ "status": "ok" }),
        Err(err) => {
            overall = "error";
            json!({ "status": "error", "detail": err.to_string() })
        }
    };
    Json(json!({ "overall": overall, "redis": redis }))
}

async fn metrics(State(state): State<ScraperState>) -> impl IntoResponse {
    state.metrics.to_prometheus()
}
