//! Multi-level circuit breaker backed by the KV store.
//!
//! State per circuit key: a failure counter (TTL = longest suspension) and
//! a suspend flag (TTL = level duration). Mutations are serialized under a
//! process-local mutex; cross-process atomicity comes from KV INCR.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{CircuitLevel, Config};
use crate::kv::KvStore;
use crate::metrics::Metrics;

pub struct CircuitBreaker {
    kv: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    levels: Vec<CircuitLevel>,
    webhook: Option<String>,
    http: reqwest::Client,
    lock: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(kv: Arc<dyn KvStore>, metrics: Arc<Metrics>, cfg: &Config) -> Self {
        Self::with_levels(kv, metrics, cfg.circuit_levels.to_vec(), cfg.slack_webhook_url.clone())
    }

    pub fn with_levels(
        kv: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
        levels: Vec<CircuitLevel>,
        webhook: Option<String>,
    ) -> Self {
        Self {
            kv,
            metrics,
            levels,
            webhook,
            http: reqwest::Client::new(),
            lock: Mutex::new(()),
        }
    }

    fn keys(key: &str) -> (String, String) {
        (format!("{}:failures", key), format!("{}:suspend", key))
    }

    /// True when the circuit is closed (requests allowed).
    pub async fn allow_request(&self, key: &str) -> bool {
        let (_, suspend_key) = Self::keys(key);
        !self.kv.exists(&suspend_key).await.unwrap_or(false)
    }

    /// Increments the failure counter and opens the circuit once a level
    /// threshold is met. The highest level reuses the previous level's
    /// duration to avoid unbounded escalation.
    pub async fn record_failure(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let (failures_key, suspend_key) = Self::keys(key);

        let count = self.kv.incr(&failures_key).await?;
        if count == 1 {
            let max_suspend = self
                .levels
                .iter()
                .map(|l| l.suspend_secs)
                .max()
                .unwrap_or(0);
            self.kv.expire(&failures_key, max_suspend).await?;
        }

        for (idx, level) in self.levels.iter().enumerate().rev() {
            if count as u64 >= level.threshold {
                let mut suspend_secs = level.suspend_secs;
                if idx == self.levels.len() - 1 && idx > 0 {
                    suspend_secs = self.levels[idx - 1].suspend_secs;
                }

                self.kv
                    .set_ex(&suspend_key, "1", suspend_secs)
                    .await?;

                self.metrics.circuit_open.set(1.0);
                self.metrics.circuit_state_changes_total.inc("open");
                info!(key, failures = count, suspend_secs, "circuit opened");

                if idx == self.levels.len() - 1 {
                    self.notify_slack(level.threshold, suspend_secs).await;
                }
                break;
            }
        }
        Ok(())
    }

    /// Closes the circuit, clearing both flag and counter.
    pub async fn record_success(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let (failures_key, suspend_key) = Self::keys(key);
        self.kv.del(&failures_key).await?;
        self.kv.del(&suspend_key).await?;
        self.metrics.circuit_open.set(0.0);
        self.metrics.circuit_state_changes_total.inc("closed");
        Ok(())
    }

    /// Remaining suspension in seconds, if any.
    pub async fn suspend_ttl(&self, key: &str) -> Option<i64> {
        let (_, suspend_key) = Self::keys(key);
        match self.kv.ttl(&suspend_key).await {
            Ok(ttl) if ttl > 0 => Some(ttl),
            _ => None,
        }
    }

    /// Best-effort Slack webhook for the maximum escalation level.
    async fn notify_slack(&self, threshold: u64, suspend_secs: u64) {
        let Some(webhook) = &self.webhook else {
            return;
        };
        let payload = serde_json::json!({
            "text": format!(
                ":rotating_light: *Circuit Breaker* top level reached!\nThreshold: {} failures.\nSuspension: {} min.",
                threshold,
                suspend_secs / 60
            )
        });
        let result = self
            .http
            .post(webhook)
            .json(&payload)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        if let Err(err) = result {
            warn!(error = %err, "slack circuit notification failed");
        }
    }
}
