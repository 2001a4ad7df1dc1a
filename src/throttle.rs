//! Outbound request pacing.
//!
//! A token bucket with jitter paces every outbound fetch, a humanized
//! delay stretches waits by page length, and 429 responses feed an
//! adaptive backoff that permanently lowers the refill rate toward a
//! floor.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::{sleep, Instant};

use crate::config::Config;
use crate::metrics::Metrics;

pub struct ThrottleManager {
    rate: f64,
    capacity: f64,
    tokens: f64,
    timestamp: Instant,
    jitter_min: f64,
    jitter_max: f64,
    min_rate: f64,
    decrease_factor: f64,
}

impl ThrottleManager {
    pub fn new(cfg: &Config) -> Self {
        Self::with_params(
            cfg.throttle_rate,
            cfg.throttle_capacity,
            (cfg.jitter_min, cfg.jitter_max),
            cfg.throttle_min_rate,
            cfg.throttle_decrease_factor,
        )
    }

    pub fn with_params(
        rate: f64,
        capacity: f64,
        jitter_range: (f64, f64),
        min_rate: f64,
        decrease_factor: f64,
    ) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            timestamp: Instant::now(),
            jitter_min: jitter_range.0,
            jitter_max: jitter_range.1,
            min_rate,
            decrease_factor,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Robots.txt Crawl-delay rewrites the jitter band for this request.
    pub fn set_jitter_range(&mut self, min: f64, max: f64) {
        self.jitter_min = min;
        self.jitter_max = max;
    }

    fn jitter(&self, metrics: &Metrics) -> f64 {
        let jitter = if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        metrics.scraper_jitter_seconds.observe(jitter);
        jitter
    }

    /// Refills by elapsed time, then either consumes a token (sleeping only
    /// the jitter) or sleeps until one token regenerates plus jitter.
    pub async fn wait(&mut self, metrics: &Metrics) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.timestamp).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.timestamp = now;

        if self.tokens < 1.0 {
            let sleep_time = (1.0 - self.tokens) / self.rate;
            let jitter = self.jitter(metrics);
            sleep(Duration::from_secs_f64(sleep_time + jitter)).await;
            self.tokens = 0.0;
        } else {
            let jitter = self.jitter(metrics);
            sleep(Duration::from_secs_f64(jitter)).await;
            self.tokens -= 1.0;
        }
    }

    /// Exponential backoff after an HTTP 429, plus a permanent rate
    /// decrease toward `min_rate`. The caller records the circuit failure.
    pub async fn backoff(&mut self, attempt: u32, metrics: &Metrics) {
        let base = if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        metrics.scraper_jitter_seconds.observe(base);
        let delay = 2f64.powi(attempt.min(16) as i32) * base;
        sleep(Duration::from_secs_f64(delay)).await;

        let new_rate = (self.rate * self.decrease_factor).max(self.min_rate);
        if new_rate < self.rate {
            self.rate = new_rate;
        }
        metrics.scraper_backoff_factor.set(self.rate);
    }
}

/// Sleep durations that mimic a human skimming the page.
pub struct HumanizedDelay {
    avg_wpm: f64,
    base_delay: f64,
    fatigue_min: f64,
    fatigue_max: f64,
}

impl HumanizedDelay {
    pub fn new(cfg: &Config) -> Self {
        Self::with_params(
            cfg.human_avg_wpm,
            cfg.human_base_delay,
            (cfg.human_fatigue_min, cfg.human_fatigue_max),
        )
    }

    pub fn with_params(avg_wpm: f64, base_delay: f64, fatigue_range: (f64, f64)) -> Self {
        Self {
            avg_wpm,
            base_delay,
            fatigue_min: fatigue_range.0,
            fatigue_max: fatigue_range.1,
        }
    }

    pub fn base_delay(&self) -> f64 {
        self.base_delay
    }

    /// base + reflection + reading time (word count over wpm) + fatigue.
    pub fn calculate_delay(&self, text: Option<&str>, reflection_time: f64) -> f64 {
        let words = text.map(|t| t.split_whitespace().count()).unwrap_or(0) as f64;
        let reading_time = words / self.avg_wpm * 60.0;
        let fatigue = if self.fatigue_max > self.fatigue_min {
            rand::thread_rng().gen_range(self.fatigue_min..=self.fatigue_max)
        } else {
            self.fatigue_min
        };
        self.base_delay + reflection_time + reading_time + fatigue
    }

    pub async fn wait(&self, text: Option<&str>) {
        let delay = self.calculate_delay(text, 1.0);
        sleep(Duration::from_secs_f64(delay)).await;
    }

    /// Slows the pace after a block; compounds across invocations.
    pub fn prolong(&mut self, factor: f64) {
        self.base_delay *= factor;
    }
}

/// Parses a `Retry-After` header value: integer seconds or an HTTP-date.
/// Returns a non-negative delay, or None when unparseable.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        return value.parse().ok();
    }
    let parsed = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let diff = (parsed.with_timezone(&Utc) - Utc::now()).num_seconds();
    Some(diff.max(0) as u64)
}
