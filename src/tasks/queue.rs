//! Broker lanes over the KV store.
//!
//! Two lists back the `scraping` and `monitor` lanes; delayed tasks park in
//! a sorted set scored by their ETA and are promoted when due. Delivery is
//! at-least-once, so every task body must be idempotent.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::kv::KvStore;

pub const LANE_SCRAPING: &str = "scraping";
pub const LANE_MONITOR: &str = "monitor";

pub const TASK_COLLECT_PRODUCT: &str = "collect_product_task";
pub const TASK_COLLECT_COMPETITOR: &str = "collect_competitor_task";
pub const TASK_COMPARE_PRICES: &str = "compare_prices_task";
pub const TASK_SEND_NOTIFICATION: &str = "send_notification_task";
pub const TASK_DISPATCH_PRICE_ALERT: &str = "dispatch_price_alert_task";
pub const TASK_SEND_ALERT: &str = "send_alert_task";

const ETA_KEY: &str = "queue:eta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub name: String,
    pub lane: String,
    pub args: serde_json::Value,
    pub attempt: u32,
}

impl TaskEnvelope {
    pub fn new(name: &str, lane: &str, args: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            lane: lane.to_string(),
            args,
            attempt: 0,
        }
    }

    pub fn retry(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            lane: self.lane.clone(),
            args: self.args.clone(),
            attempt: self.attempt + 1,
        }
    }
}

pub struct TaskQueue {
    kv: Arc<dyn KvStore>,
}

impl TaskQueue {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn lane_key(lane: &str) -> String {
        format!("queue:{}", lane)
    }

    pub async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<()> {
        self.kv
            .rpush(&Self::lane_key(&envelope.lane), &serde_json::to_string(envelope)?)
            .await
    }

    /// Parks the task until `eta`; a promote pass moves it onto its lane.
    pub async fn enqueue_at(&self, envelope: &TaskEnvelope, eta: DateTime<Utc>) -> Result<()> {
        // Wrap with the eta so identical payloads scheduled twice stay
        // distinct members.
        let member = serde_json::to_string(&json!({
            "eta_ms": eta.timestamp_millis(),
            "task": envelope,
        }))?;
        self.kv
            .zadd(ETA_KEY, &member, eta.timestamp_millis() as f64)
            .await
    }

    pub async fn pop(&self, lane: &str) -> Result<Option<TaskEnvelope>> {
        loop {
            let Some(raw) = self.kv.lpop(&Self::lane_key(lane)).await? else {
                return Ok(None);
            };
            match serde_json::from_str(&raw) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(err) => {
                    warn!(lane, error = %err, "dropping malformed task payload");
                }
            }
        }
    }

    /// Moves every due delayed task onto its lane; returns how many moved.
    pub async fn promote_due(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let due = self.kv.zpop_due(ETA_KEY, now_ms).await?;
        let mut promoted = 0;
        for member in due {
            let parsed: Result<serde_json::Value, _> = serde_json::from_str(&member);
            let envelope = parsed
                .ok()
                .and_then(|v| serde_json::from_value::<TaskEnvelope>(v["task"].clone()).ok());
            match envelope {
                Some(envelope) => {
                    self.enqueue(&envelope).await?;
                    promoted += 1;
                }
                None => warn!("dropping malformed delayed task"),
            }
        }
        Ok(promoted)
    }

    pub async fn depth(&self, lane: &str) -> i64 {
        self.kv.llen(&Self::lane_key(lane)).await.unwrap_or(0)
    }
}
