//! Application configuration.
//!
//! All tunables are loaded once from the environment into an immutable
//! `Config` that every component receives by reference. The same struct
//! serves both binaries; the scraper only reads the sections it needs.

use std::env;

use rust_decimal::Decimal;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Parses a Celery-style rate string like `"10/m"` into requests-per-window
/// plus window seconds. Supported suffixes: `/s`, `/m`, `/h`.
pub fn parse_rate_limit(raw: &str) -> Option<(u64, u64)> {
    let (count, unit) = raw.split_once('/')?;
    let count: u64 = count.trim().parse().ok()?;
    let window = match unit.trim() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return None,
    };
    Some((count, window))
}

/// Thresholds and suspension durations for one circuit-breaker level.
#[derive(Debug, Clone, Copy)]
pub struct CircuitLevel {
    pub threshold: u64,
    pub suspend_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Service endpoints
    pub port: u16,
    pub scraper_port: u16,
    pub scraper_service_url: String,
    /// Optional headless rendering sidecar used for block recovery.
    pub browser_render_url: Option<String>,
    pub browser_timeout_secs: u64,
    pub fetch_timeout_secs: u64,

    // Stores
    pub database_path: String,
    pub redis_url: String,

    // Circuit breaker
    pub circuit_levels: [CircuitLevel; 3],
    pub slack_webhook_url: Option<String>,

    // Robots.txt cache
    pub robots_cache_ttl: u64,

    // Content cache
    pub cache_base_ttl: u64,
    pub cache_max_multiplier: u32,

    // Humanized delay
    pub human_avg_wpm: f64,
    pub human_base_delay: f64,
    pub human_fatigue_min: f64,
    pub human_fatigue_max: f64,

    // Token bucket
    pub throttle_rate: f64,
    pub throttle_capacity: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
    pub throttle_min_rate: f64,
    pub throttle_decrease_factor: f64,

    // Sliding-window service limits
    pub monitored_rate_limit: u64,
    pub competitor_service_rate_limit: u64,
    pub rate_limit_window: u64,

    // Per-task rate limit strings ("<N>/m")
    pub scraper_rate_limit: String,
    pub competitor_rate_limit: String,
    pub compare_rate_limit: String,
    pub alert_rate_limit: String,

    // Alerting
    pub alert_duplicate_window: i64,
    pub alert_rule_cooldown: i64,

    // Comparison
    pub price_tolerance: Decimal,
    pub price_change_threshold: Decimal,
    pub comparison_last_success_ttl: u64,

    // Adaptive recheck
    pub recheck_base_interval: f64,
    pub recheck_min_interval: f64,
    pub recheck_max_interval: f64,
    pub recheck_peak_hours: (u32, u32),
    pub recheck_jitter: f64,

    // Dispatch
    pub batch_size_scraping: usize,
    pub batch_size_competitor: usize,
    pub worker_concurrency: usize,
    pub task_max_retries: u32,
    pub task_retry_delay_secs: i64,

    // Notification channels
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_tls: bool,
    pub smtp_from: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_sms_from: Option<String>,
    pub twilio_whatsapp_from: Option<String>,
    pub fcm_server_key: Option<String>,
    pub webhook_url: Option<String>,

    // Audit
    pub audit_dir: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let redis_host = env_or("REDIS_HOST", "redis");
        let redis_port: u16 = env_parse("REDIS_PORT", 6379);
        let redis_db: u32 = env_parse("REDIS_DB", 0);
        let redis_password = env_or("REDIS_PASSWORD", "");
        let pwd = if redis_password.is_empty() {
            String::new()
        } else {
            format!(":{}@", redis_password)
        };
        let redis_url = env::var("REDIS_URL")
            .unwrap_or_else(|_| format!("redis://{}{}:{}/{}", pwd, redis_host, redis_port, redis_db));

        let circuit_levels = [
            CircuitLevel {
                threshold: env_parse("CIRCUIT_LVL1_THRESHOLD", 3),
                suspend_secs: env_parse("CIRCUIT_LVL1_SUSPEND", 300),
            },
            CircuitLevel {
                threshold: env_parse("CIRCUIT_LVL2_THRESHOLD", 10),
                suspend_secs: env_parse("CIRCUIT_LVL2_SUSPEND", 1800),
            },
            CircuitLevel {
                threshold: env_parse("CIRCUIT_LVL3_THRESHOLD", 25),
                suspend_secs: env_parse("CIRCUIT_LVL3_SUSPEND", 7200),
            },
        ];

        let price_tolerance: Decimal = env_or("PRICE_TOLERANCE", "0.01")
            .parse()
            .unwrap_or_else(|_| Decimal::new(1, 2));
        let price_change_threshold: Decimal = env_or("PRICE_CHANGE_THRESHOLD", "0.01")
            .parse()
            .unwrap_or(price_tolerance);

        Ok(Self {
            port: env_parse("PORT", 8000),
            scraper_port: env_parse("SCRAPER_PORT", 8001),
            scraper_service_url: env_or("SCRAPER_SERVICE_URL", "http://localhost:8001"),
            browser_render_url: env_opt("BROWSER_RENDER_URL"),
            browser_timeout_secs: env_parse("BROWSER_TIMEOUT_SECS", 30),
            fetch_timeout_secs: env_parse("FETCH_TIMEOUT_SECS", 30),

            database_path: env_or("DATABASE_PATH", "./marketwatch.db"),
            redis_url,

            circuit_levels,
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),

            robots_cache_ttl: env_parse("ROBOTS_CACHE_TTL", 24 * 3600),

            cache_base_ttl: env_parse("CACHE_BASE_TTL", 3600),
            cache_max_multiplier: env_parse("CACHE_MAX_MULTIPLIER", 5),

            human_avg_wpm: env_parse("HUMAN_AVG_WPM", 200.0),
            human_base_delay: env_parse("HUMAN_BASE_DELAY", 1.0),
            human_fatigue_min: env_parse("HUMAN_FATIGUE_MIN", 0.5),
            human_fatigue_max: env_parse("HUMAN_FATIGUE_MAX", 2.0),

            throttle_rate: env_parse("THROTTLE_RATE", 0.2),
            throttle_capacity: env_parse("THROTTLE_CAPACITY", 3.0),
            jitter_min: env_parse("JITTER_MIN", 2.0),
            jitter_max: env_parse("JITTER_MAX", 7.0),
            throttle_min_rate: env_parse("THROTTLE_MIN_RATE", 0.01),
            throttle_decrease_factor: env_parse("THROTTLE_DECREASE_FACTOR", 0.9),

            monitored_rate_limit: env_parse("MONITORED_RATE_LIMIT", 100),
            competitor_service_rate_limit: env_parse("COMPETITOR_SERVICE_RATE_LIMIT", 200),
            rate_limit_window: env_parse("RATE_LIMIT_WINDOW", 3600),

            scraper_rate_limit: env_or("SCRAPER_RATE_LIMIT", "10/m"),
            competitor_rate_limit: env_or("COMPETITOR_RATE_LIMIT", "10/m"),
            compare_rate_limit: env_or("COMPARE_RATE_LIMIT", "120/m"),
            alert_rate_limit: env_or("ALERT_RATE_LIMIT", "60/m"),

            alert_duplicate_window: env_parse("ALERT_DUPLICATE_WINDOW", 600),
            alert_rule_cooldown: env_parse("ALERT_RULE_COOLDOWN", 3600),

            price_tolerance,
            price_change_threshold,
            comparison_last_success_ttl: env_parse("COMPARISON_LAST_SUCCESS_TTL", 86400),

            recheck_base_interval: env_parse("ADAPTIVE_RECHECK_BASE_INTERVAL", 7200.0),
            recheck_min_interval: env_parse("ADAPTIVE_RECHECK_MIN_INTERVAL", 120.0),
            recheck_max_interval: env_parse("ADAPTIVE_RECHECK_MAX_INTERVAL", 3600.0),
            recheck_peak_hours: (
                env_parse("ADAPTIVE_RECHECK_PEAK_START", 18),
                env_parse("ADAPTIVE_RECHECK_PEAK_END", 22),
            ),
            recheck_jitter: env_parse("ADAPTIVE_RECHECK_JITTER", 0.1),

            batch_size_scraping: env_parse("BATCH_SIZE_SCRAPING", 10),
            batch_size_competitor: env_parse("BATCH_SIZE_COMPETITOR", 20),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 8),
            task_max_retries: env_parse("TASK_MAX_RETRIES", 3),
            task_retry_delay_secs: env_parse("TASK_RETRY_DELAY_SECS", 30),

            smtp_host: env_opt("SMTP_HOST"),
            smtp_port: env_parse("SMTP_PORT", 587),
            smtp_username: env_opt("SMTP_USERNAME"),
            smtp_password: env_opt("SMTP_PASSWORD"),
            smtp_tls: env_or("SMTP_TLS", "1") == "1",
            smtp_from: env_opt("SMTP_FROM"),
            twilio_account_sid: env_opt("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: env_opt("TWILIO_AUTH_TOKEN"),
            twilio_sms_from: env_opt("TWILIO_SMS_FROM"),
            twilio_whatsapp_from: env_opt("TWILIO_WHATSAPP_FROM"),
            fcm_server_key: env_opt("FCM_SERVER_KEY"),
            webhook_url: env_opt("WEBHOOK_URL"),

            audit_dir: env_or("AUDIT_LOG_DIR", "logs/audit"),
        })
    }
}

impl Default for Config {
    /// Defaults without touching the environment; used by tests.
    fn default() -> Self {
        Self {
            port: 8000,
            scraper_port: 8001,
            scraper_service_url: "http://localhost:8001".into(),
            browser_render_url: None,
            browser_timeout_secs: 30,
            fetch_timeout_secs: 30,
            database_path: ":memory:".into(),
            redis_url: "redis://localhost:6379/0".into(),
            circuit_levels: [
                CircuitLevel { threshold: 3, suspend_secs: 300 },
                CircuitLevel { threshold: 10, suspend_secs: 1800 },
                CircuitLevel { threshold: 25, suspend_secs: 7200 },
            ],
            slack_webhook_url: None,
            robots_cache_ttl: 24 * 3600,
            cache_base_ttl: 3600,
            cache_max_multiplier: 5,
            human_avg_wpm: 200.0,
            human_base_delay: 1.0,
            human_fatigue_min: 0.5,
            human_fatigue_max: 2.0,
            throttle_rate: 0.2,
            throttle_capacity: 3.0,
            jitter_min: 2.0,
            jitter_max: 7.0,
            throttle_min_rate: 0.01,
            throttle_decrease_factor: 0.9,
            monitored_rate_limit: 100,
            competitor_service_rate_limit: 200,
            rate_limit_window: 3600,
            scraper_rate_limit: "10/m".into(),
            competitor_rate_limit: "10/m".into(),
            compare_rate_limit: "120/m".into(),
            alert_rate_limit: "60/m".into(),
            alert_duplicate_window: 600,
            alert_rule_cooldown: 3600,
            price_tolerance: Decimal::new(1, 2),
            price_change_threshold: Decimal::new(1, 2),
            comparison_last_success_ttl: 86400,
            recheck_base_interval: 7200.0,
            recheck_min_interval: 120.0,
            recheck_max_interval: 3600.0,
            recheck_peak_hours: (18, 22),
            recheck_jitter: 0.1,
            batch_size_scraping: 10,
            batch_size_competitor: 20,
            worker_concurrency: 8,
            task_max_retries: 3,
            task_retry_delay_secs: 30,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            smtp_tls: true,
            smtp_from: None,
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_sms_from: None,
            twilio_whatsapp_from: None,
            fcm_server_key: None,
            webhook_url: None,
            audit_dir: "logs/audit".into(),
        }
    }
}
