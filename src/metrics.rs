//! Prometheus metrics for both services.
//!
//! Exposes metrics in Prometheus text format via the HTTP `/metrics`
//! endpoint. Counters are plain atomics; labelled families keep a small
//! map keyed by label value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Counter family with one free-form label.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: RwLock<HashMap<String, u64>>,
}

impl LabeledCounter {
    pub fn inc(&self, label: &str) {
        *self.values.write().entry(label.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values.read().get(label).copied().unwrap_or(0)
    }

    fn render(&self, out: &mut String, name: &str, label_name: &str) {
        for (label, value) in self.values.read().iter() {
            out.push_str(&format!("{}{{{}=\"{}\"}} {}\n", name, label_name, label, value));
        }
    }
}

/// Gauge holding an f64 (stored as bit pattern).
#[derive(Debug, Default)]
pub struct GaugeF64 {
    bits: AtomicU64,
}

impl GaugeF64 {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Simple histogram for duration observations in seconds.
#[derive(Debug)]
pub struct DurationHistogram {
    /// Bucket boundaries in milliseconds
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    /// Sum of all observations (milliseconds)
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        // 5ms .. 60s
        let buckets = vec![5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl DurationHistogram {
    pub fn observe(&self, seconds: f64) {
        let ms = (seconds * 1000.0).max(0.0) as u64;
        for (i, &boundary) in self.buckets.iter().enumerate() {
            if ms <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str) {
        let mut cumulative = 0u64;
        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                boundary as f64 / 1000.0,
                cumulative
            ));
        }
        out.push_str(&format!(
            "{}_bucket{{le=\"+Inf\"}} {}\n",
            name,
            self.count.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.sum_ms.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        out.push_str(&format!("{}_count {}\n", name, self.count.load(Ordering::Relaxed)));
    }
}

/// Shared metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    // Scraper pipeline
    pub scraper_requests_total: LabeledCounter,
    pub scraper_blocked_total: AtomicU64,
    pub scraper_captcha_total: AtomicU64,
    pub scraper_in_flight: AtomicI64,
    pub scraper_url_status_total: LabeledCounter,
    pub scraper_browser_fallback_total: AtomicU64,
    pub scraper_browser_recovery_success_total: AtomicU64,
    pub scraper_jitter_seconds: DurationHistogram,
    pub scraper_backoff_factor: GaugeF64,
    pub scraping_latency_seconds: DurationHistogram,
    pub scraping_suspended_flag: GaugeF64,

    // Content cache
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    pub cache_hits_endpoint_total: LabeledCounter,
    pub cache_misses_endpoint_total: LabeledCounter,

    // Circuit breaker
    pub circuit_open: GaugeF64,
    pub circuit_state_changes_total: LabeledCounter,

    // Scheduler
    pub recheck_scheduled_total: AtomicU64,

    // Tasks / queues
    pub tasks_total: LabeledCounter,
    pub task_duration_seconds: DurationHistogram,
    pub queue_length: RwLock<HashMap<String, i64>>,
    pub tasks_dispatched_total: LabeledCounter,

    // Notifications
    pub notifications_sent_total: LabeledCounter,
    pub notifications_skipped_total: LabeledCounter,
    pub notification_send_duration_seconds: DurationHistogram,
    pub alert_rules_triggered_total: LabeledCounter,
    pub alert_rules_suppressed_total: LabeledCounter,

    // Audit
    pub audit_records_total: LabeledCounter,
    pub audit_errors_total: LabeledCounter,
    pub audit_record_duration_seconds: DurationHistogram,

    // Stores
    pub kv_memory_bytes: GaugeF64,
    pub db_rows: RwLock<HashMap<String, i64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_length(&self, queue: &str, len: i64) {
        self.queue_length.write().insert(queue.to_string(), len);
    }

    pub fn set_db_rows(&self, table: &str, rows: i64) {
        self.db_rows.write().insert(table.to_string(), rows);
    }

    /// Full Prometheus exposition.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        self.scraper_requests_total
            .render(&mut out, "scraper_requests_total", "status_code");
        out.push_str(&format!(
            "scraper_http_blocked_total {}\n",
            self.scraper_blocked_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "scraper_captcha_total {}\n",
            self.scraper_captcha_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "scraper_in_flight {}\n",
            self.scraper_in_flight.load(Ordering::Relaxed)
        ));
        self.scraper_url_status_total
            .render(&mut out, "scraper_url_status_total", "status");
        out.push_str(&format!(
            "scraper_browser_fallback_total {}\n",
            self.scraper_browser_fallback_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "scraper_browser_recovery_success_total {}\n",
            self.scraper_browser_recovery_success_total.load(Ordering::Relaxed)
        ));
        self.scraper_jitter_seconds.render(&mut out, "scraper_jitter_seconds");
        out.push_str(&format!("scraper_backoff_factor {}\n", self.scraper_backoff_factor.get()));
        self.scraping_latency_seconds
            .render(&mut out, "scraping_latency_seconds");
        out.push_str(&format!(
            "scraping_suspended_flag {}\n",
            self.scraping_suspended_flag.get()
        ));

        out.push_str(&format!(
            "cache_hits_total {}\n",
            self.cache_hits_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "cache_misses_total {}\n",
            self.cache_misses_total.load(Ordering::Relaxed)
        ));
        self.cache_hits_endpoint_total
            .render(&mut out, "cache_hits_endpoint_total", "endpoint");
        self.cache_misses_endpoint_total
            .render(&mut out, "cache_misses_endpoint_total", "endpoint");

        out.push_str(&format!("scraper_circuit_open {}\n", self.circuit_open.get()));
        self.circuit_state_changes_total
            .render(&mut out, "scraper_circuit_state_changes_total", "state");

        out.push_str(&format!(
            "recheck_scheduled_total {}\n",
            self.recheck_scheduled_total.load(Ordering::Relaxed)
        ));

        self.tasks_total.render(&mut out, "worker_tasks_total", "task_status");
        self.task_duration_seconds.render(&mut out, "task_duration_seconds");
        for (queue, len) in self.queue_length.read().iter() {
            out.push_str(&format!("queue_length{{queue=\"{}\"}} {}\n", queue, len));
        }
        self.tasks_dispatched_total
            .render(&mut out, "tasks_dispatched_total", "task");

        self.notifications_sent_total
            .render(&mut out, "notifications_sent_total", "channel_success");
        self.notifications_skipped_total
            .render(&mut out, "notifications_skipped_total", "reason");
        self.notification_send_duration_seconds
            .render(&mut out, "notification_send_duration_seconds");
        self.alert_rules_triggered_total
            .render(&mut out, "alert_rules_triggered_total", "rule_type");
        self.alert_rules_suppressed_total
            .render(&mut out, "alert_rules_suppressed_total", "reason");

        self.audit_records_total
            .render(&mut out, "audit_records_total", "stage");
        self.audit_errors_total
            .render(&mut out, "audit_errors_total", "stage");
        self.audit_record_duration_seconds
            .render(&mut out, "audit_record_duration_seconds");

        out.push_str(&format!("redis_memory_usage_bytes {}\n", self.kv_memory_bytes.get()));
        for (table, rows) in self.db_rows.read().iter() {
            out.push_str(&format!("db_rows{{table=\"{}\"}} {}\n", table, rows));
        }

        out
    }
}
