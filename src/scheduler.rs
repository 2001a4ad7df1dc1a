//! Adaptive recheck scheduling.
//!
//! Computes when each product should be polled next from recent price
//! dynamics and failure history, and persists the schedule in the KV
//! store so the dispatch tasks can prioritize collections.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::config::Config;
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::models::{ComparisonResult, MonitoredProduct};

const FAILURE_COUNTER_TTL_SECS: u64 = 86_400;

pub struct AdaptiveRecheck {
    kv: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    base_interval: f64,
    min_interval: f64,
    max_interval: f64,
    peak_start: u32,
    peak_end: u32,
    jitter: f64,
}

impl AdaptiveRecheck {
    pub fn new(kv: Arc<dyn KvStore>, metrics: Arc<Metrics>, cfg: &Config) -> Self {
        Self::with_params(
            kv,
            metrics,
            cfg.recheck_base_interval,
            cfg.recheck_min_interval,
            cfg.recheck_max_interval,
            cfg.recheck_peak_hours,
            cfg.recheck_jitter,
        )
    }

    pub fn with_params(
        kv: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
        base_interval: f64,
        min_interval: f64,
        max_interval: f64,
        peak_hours: (u32, u32),
        jitter: f64,
    ) -> Self {
        Self {
            kv,
            metrics,
            base_interval,
            min_interval,
            max_interval,
            peak_start: peak_hours.0,
            peak_end: peak_hours.1,
            jitter,
        }
    }

    fn next_key(identifier: &str) -> String {
        format!("recheck:next:{}", identifier)
    }

    fn fail_key(identifier: &str) -> String {
        format!("recheck:fail:{}", identifier)
    }

    /// True when no schedule exists or the stored time has passed.
    /// A KV failure also yields true so a flaky store never starves polling.
    pub async fn should_recheck(&self, identifier: &str) -> bool {
        match self.kv.get(&Self::next_key(identifier)).await {
            Ok(Some(raw)) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(next) => next.with_timezone(&Utc) <= Utc::now(),
                Err(_) => true,
            },
            Ok(None) => true,
            Err(err) => {
                warn!(identifier, error = %err, "recheck lookup failed, assuming due");
                true
            }
        }
    }

    /// Updates the consecutive-failure counter for the identifier.
    pub async fn record_result(&self, identifier: &str, success: bool) {
        let key = Self::fail_key(identifier);
        if success {
            if let Err(err) = self.kv.del(&key).await {
                warn!(identifier, error = %err, "failed clearing failure counter");
            }
            return;
        }
        let failures = self.failures(identifier).await + 1;
        if let Err(err) = self
            .kv
            .set_ex(&key, &failures.to_string(), FAILURE_COUNTER_TTL_SECS)
            .await
        {
            warn!(identifier, error = %err, "failed recording failure");
        }
    }

    pub async fn failures(&self, identifier: &str) -> u32 {
        self.kv
            .get(&Self::fail_key(identifier))
            .await
            .ok()
            .flatten()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    /// Multiplicative interval composition. Order is irrelevant except for
    /// the final clamp.
    pub fn compute_interval(
        &self,
        comparisons: &[ComparisonResult],
        target_price: Option<Decimal>,
        failures: u32,
        hour: u32,
    ) -> f64 {
        let mut interval = self.base_interval;

        if let Some(latest) = comparisons.first() {
            // Recent alerts tighten the loop.
            if !latest.alerts.is_empty() {
                interval *= 0.5;
            }

            if let (Some(target), Some(low)) = (
                target_price.filter(|t| *t > Decimal::ZERO),
                latest.lowest_competitor.as_ref().map(|d| d.price),
            ) {
                if (low - target).abs() <= target * dec!(0.05) {
                    interval *= 0.7;
                }
            }

            // Volatility of competitor averages over the last runs.
            let avg_prices: Vec<Decimal> = comparisons
                .iter()
                .take(3)
                .filter_map(|c| c.average_competitor_price)
                .collect();
            if avg_prices.len() >= 2 {
                let mean = avg_prices.iter().sum::<Decimal>() / Decimal::from(avg_prices.len());
                let spread = avg_prices.iter().max().copied().unwrap_or_default()
                    - avg_prices.iter().min().copied().unwrap_or_default();
                if mean > Decimal::ZERO && spread > mean * dec!(0.1) {
                    interval *= 0.7;
                } else {
                    interval *= 1.2;
                }
            }
        }

        if self.peak_start <= hour && hour < self.peak_end {
            interval *= 0.7;
        }

        if failures > 0 {
            interval *= 2f64.powi(failures.min(30) as i32);
        }

        // Small noise so schedules never synchronize perfectly.
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        interval *= jitter_factor;

        interval.clamp(self.min_interval, self.max_interval)
    }

    /// Computes and persists the next collection time for the product.
    pub async fn schedule_next(
        &self,
        product: &MonitoredProduct,
        comparisons: &[ComparisonResult],
    ) -> DateTime<Utc> {
        let identifier = product.id.to_string();
        let failures = self.failures(&identifier).await;
        let now = Utc::now();
        let interval =
            self.compute_interval(comparisons, product.target_price, failures, now.hour());
        let next_time = now + chrono::Duration::milliseconds((interval * 1000.0) as i64);

        if let Err(err) = self
            .kv
            .set(&Self::next_key(&identifier), &next_time.to_rfc3339())
            .await
        {
            // Scheduling is deferred to the next invocation.
            warn!(identifier, error = %err, "failed persisting recheck schedule");
        }
        self.metrics
            .recheck_scheduled_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(identifier, interval_secs = interval, "recheck scheduled");
        next_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::models::{AlertCandidate, Discrepancy, MonitoringType, MonitoredStatus};
    use uuid::Uuid;

    fn scheduler(base: f64, min: f64, max: f64, jitter: f64) -> AdaptiveRecheck {
        AdaptiveRecheck::with_params(
            Arc::new(MemoryKv::new()),
            Arc::new(Metrics::new()),
            base,
            min,
            max,
            (18, 22),
            jitter,
        )
    }

    fn product() -> MonitoredProduct {
        let now = Utc::now();
        MonitoredProduct {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "notebook".into(),
            monitoring_type: MonitoringType::Scraping,
            product_url: "https://produto.mercadolivre.com.br/MLB-123".into(),
            target_price: Some(dec!(100.00)),
            current_price: Some(dec!(150.00)),
            free_shipping: false,
            thumbnail: None,
            etag: None,
            status: MonitoredStatus::Active,
            last_checked: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn comparison_with(
        alerts: usize,
        average: Option<Decimal>,
        lowest_price: Option<Decimal>,
    ) -> ComparisonResult {
        ComparisonResult {
            monitored_price: dec!(150.00),
            target_price: dec!(100.00),
            average_competitor_price: average,
            lowest_competitor: lowest_price.map(|price| Discrepancy {
                competitor_id: Uuid::new_v4(),
                name: "rival".into(),
                price,
                pct_x_target: None,
                pct_x_monitored: None,
                delta_x_min_competitor: Decimal::ZERO,
                delta_x_monitored: Decimal::ZERO,
                old_price: None,
                change_from_old: None,
                pct_change_from_old: None,
            }),
            highest_competitor: None,
            discrepancies: Vec::new(),
            alerts: (0..alerts).map(|_| AlertCandidate::default()).collect(),
        }
    }

    #[test]
    fn test_peak_hour_shortening() {
        // Base 7200s during peak with jitter 0.1: 7200 * 0.7 * [0.9, 1.1].
        let sched = scheduler(7200.0, 120.0, 86_400.0, 0.1);
        for _ in 0..50 {
            let interval = sched.compute_interval(&[], Some(dec!(100.00)), 0, 19);
            assert!(
                (4536.0..=5544.0).contains(&interval),
                "interval {} out of peak range",
                interval
            );
        }
    }

    #[test]
    fn test_off_peak_keeps_base() {
        let sched = scheduler(7200.0, 120.0, 86_400.0, 0.0);
        let interval = sched.compute_interval(&[], None, 0, 10);
        assert!((interval - 7200.0).abs() < 1e-6);
    }

    #[test]
    fn test_recent_alerts_halve_interval() {
        let sched = scheduler(1000.0, 1.0, 100_000.0, 0.0);
        let comps = vec![comparison_with(2, None, None)];
        let interval = sched.compute_interval(&comps, None, 0, 10);
        assert!((interval - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_target_proximity_shortens() {
        let sched = scheduler(1000.0, 1.0, 100_000.0, 0.0);
        // Lowest competitor within 5% of target.
        let comps = vec![comparison_with(0, None, Some(dec!(97.00)))];
        let interval = sched.compute_interval(&comps, Some(dec!(100.00)), 0, 10);
        assert!((interval - 700.0).abs() < 1e-6);

        // Far from target, factor absent.
        let comps = vec![comparison_with(0, None, Some(dec!(50.00)))];
        let interval = sched.compute_interval(&comps, Some(dec!(100.00)), 0, 10);
        assert!((interval - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_volatility_branches() {
        let sched = scheduler(1000.0, 1.0, 100_000.0, 0.0);
        // Spread above 10% of the mean: shorten.
        let comps = vec![
            comparison_with(0, Some(dec!(100.00)), None),
            comparison_with(0, Some(dec!(130.00)), None),
        ];
        let interval = sched.compute_interval(&comps, None, 0, 10);
        assert!((interval - 700.0).abs() < 1e-6);

        // Stable averages: stretch.
        let comps = vec![
            comparison_with(0, Some(dec!(100.00)), None),
            comparison_with(0, Some(dec!(101.00)), None),
        ];
        let interval = sched.compute_interval(&comps, None, 0, 10);
        assert!((interval - 1200.0).abs() < 1e-6);
    }

    #[test]
    fn test_failure_backoff_monotone() {
        let sched = scheduler(600.0, 1.0, 1_000_000.0, 0.0);
        let one = sched.compute_interval(&[], None, 1, 10);
        let two = sched.compute_interval(&[], None, 2, 10);
        let three = sched.compute_interval(&[], None, 3, 10);
        assert!((one - 1200.0).abs() < 1e-6);
        assert!((two - 2400.0).abs() < 1e-6);
        assert!(two > one && three > two);
    }

    #[test]
    fn test_clamp_bounds() {
        let sched = scheduler(7200.0, 120.0, 3600.0, 0.1);
        for failures in 0..8 {
            let interval = sched.compute_interval(&[], None, failures, 3);
            assert!((120.0..=3600.0).contains(&interval));
        }
    }

    #[tokio::test]
    async fn test_should_recheck_lifecycle() {
        let kv = Arc::new(MemoryKv::new());
        let sched = AdaptiveRecheck::with_params(
            kv.clone(),
            Arc::new(Metrics::new()),
            600.0,
            60.0,
            3600.0,
            (18, 22),
            0.0,
        );
        let p = product();
        let id = p.id.to_string();

        // No schedule yet.
        assert!(sched.should_recheck(&id).await);

        let next = sched.schedule_next(&p, &[]).await;
        assert!(next > Utc::now());
        // Freshly scheduled in the future.
        assert!(!sched.should_recheck(&id).await);

        // A stored time in the past is due again.
        kv.set(
            &format!("recheck:next:{}", id),
            &(Utc::now() - chrono::Duration::seconds(5)).to_rfc3339(),
        )
        .await
        .unwrap();
        assert!(sched.should_recheck(&id).await);
    }

    #[tokio::test]
    async fn test_record_result_counter() {
        let sched = scheduler(600.0, 60.0, 3600.0, 0.0);
        let id = Uuid::new_v4().to_string();
        assert_eq!(sched.failures(&id).await, 0);
        sched.record_result(&id, false).await;
        sched.record_result(&id, false).await;
        assert_eq!(sched.failures(&id).await, 2);
        sched.record_result(&id, true).await;
        assert_eq!(sched.failures(&id).await, 0);
    }

    #[tokio::test]
    async fn test_schedule_next_bounds() {
        let sched = scheduler(600.0, 120.0, 3600.0, 0.1);
        let p = product();
        let before = Utc::now();
        let next = sched.schedule_next(&p, &[]).await;
        let delta = (next - before).num_seconds();
        assert!(delta >= 119, "delta {}", delta);
        assert!(delta <= 3601, "delta {}", delta);
    }
}
