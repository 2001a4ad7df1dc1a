//! Block detection and recovery.
//!
//! Classifies hostile responses (429/403/CAPTCHA), then walks a recovery
//! ladder: rotate identity, clear cookies, slow the humanized pace, try a
//! browser-based refetch, and raise the global suspension with escalating
//! duration. Severity only grows until a success resets the manager.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::identity::{CookieManager, UserAgentManager};
use crate::kv::{suspend_scraping, KvStore};
use crate::metrics::Metrics;
use crate::throttle::HumanizedDelay;

/// Outcome of inspecting a response for block signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSignal {
    Ok,
    Captcha,
    Http429,
    Http403,
    Unknown,
}

impl BlockSignal {
    pub fn as_str(&self) -> &str {
        match self {
            BlockSignal::Ok => "ok",
            BlockSignal::Captcha => "captcha",
            BlockSignal::Http429 => "http_429",
            BlockSignal::Http403 => "http_403",
            BlockSignal::Unknown => "unknown",
        }
    }

    /// Severity contribution per block type.
    fn level(&self) -> u32 {
        match self {
            BlockSignal::Http429 => 1,
            BlockSignal::Http403 => 2,
            BlockSignal::Captcha => 3,
            BlockSignal::Ok | BlockSignal::Unknown => 1,
        }
    }
}

/// Classifies a response. CAPTCHA markers win over status codes.
pub fn detect_block(status: Option<u16>, body: &str) -> BlockSignal {
    let Some(status) = status else {
        return BlockSignal::Unknown;
    };
    let lowered = body.to_lowercase();
    if lowered.contains("captcha") || lowered.contains("digite os caracteres") {
        return BlockSignal::Captcha;
    }
    match status {
        429 => BlockSignal::Http429,
        403 => BlockSignal::Http403,
        _ => BlockSignal::Ok,
    }
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    html: String,
}

/// Client for the headless rendering sidecar used as a last-resort fetch.
/// Disabled (always erroring) when no endpoint is configured.
pub struct BrowserClient {
    http: reqwest::Client,
    endpoint: Option<String>,
    timeout: Duration,
}

impl BrowserClient {
    pub fn new(endpoint: Option<String>, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Renders the page in a real browser and returns the final HTML. The
    /// sidecar waits for the product title or price selector to appear.
    pub async fn fetch_html(&self, url: &str, user_agent: &str) -> Result<String> {
        let Some(endpoint) = &self.endpoint else {
            bail!("browser rendering endpoint not configured");
        };
        let payload = serde_json::json!({
            "url": url,
            "user_agent": user_agent,
            "wait_selector": "h1.ui-pdp-title, .andes-money-amount__fraction, .price-tag-fraction",
        });
        let resp = self
            .http
            .post(endpoint)
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .context("browser render request failed")?;
        if !resp.status().is_success() {
            bail!("browser render returned {}", resp.status());
        }
        let rendered: RenderResponse = resp.json().await.context("invalid render response")?;
        Ok(rendered.html)
    }
}

/// Coordinates the mitigation steps after a detected block.
pub struct BlockRecovery {
    kv: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    ua_manager: Arc<UserAgentManager>,
    cookie_manager: Arc<CookieManager>,
    delay: Arc<Mutex<HumanizedDelay>>,
    browser: Arc<BrowserClient>,
    suspension_steps: [u64; 3],
    severity: Mutex<u32>,
}

impl BlockRecovery {
    pub fn new(
        kv: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
        ua_manager: Arc<UserAgentManager>,
        cookie_manager: Arc<CookieManager>,
        delay: Arc<Mutex<HumanizedDelay>>,
        browser: Arc<BrowserClient>,
    ) -> Self {
        Self {
            kv,
            metrics,
            ua_manager,
            cookie_manager,
            delay,
            browser,
            suspension_steps: [300, 900, 1800],
            severity: Mutex::new(0),
        }
    }

    pub fn severity(&self) -> u32 {
        *self.severity.lock()
    }

    /// A successful fetch ends the escalation.
    pub fn reset(&self) {
        *self.severity.lock() = 0;
    }

    /// Applies mitigation and, for 403/CAPTCHA with a URL, attempts a
    /// browser-based refetch. Always raises the global suspension with the
    /// step matching current severity. Returns recovered HTML, if any.
    pub async fn handle_block(
        &self,
        signal: BlockSignal,
        session_id: Option<&str>,
        url: Option<&str>,
    ) -> Option<String> {
        let severity = {
            let mut guard = self.severity.lock();
            *guard = (*guard + 1).max(signal.level());
            *guard
        };

        self.ua_manager.rotate(session_id);
        self.cookie_manager.reset(session_id);
        self.delay.lock().prolong(1.5);

        let mut recovered: Option<String> = None;
        if matches!(signal, BlockSignal::Http403 | BlockSignal::Captcha) {
            if let Some(url) = url {
                self.metrics
                    .scraper_browser_fallback_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let ua = self
                    .ua_manager
                    .get_user_agent(session_id.unwrap_or("default"));
                match self.browser.fetch_html(url, &ua).await {
                    Ok(html) => {
                        self.metrics
                            .scraper_browser_recovery_success_total
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        recovered = Some(html);
                    }
                    Err(err) => {
                        warn!(url, error = %err, "browser fallback failed");
                    }
                }
            }
        }

        let idx = (severity.saturating_sub(1) as usize).min(self.suspension_steps.len() - 1);
        let suspend_secs = self.suspension_steps[idx];
        suspend_scraping(self.kv.as_ref(), &self.metrics, suspend_secs).await;
        info!(
            block_type = signal.as_str(),
            severity, suspend_secs, "block handled, scraping suspended"
        );

        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryKv, SCRAPING_SUSPENDED_KEY};

    #[test]
    fn test_detect_block_classification() {
        assert_eq!(detect_block(Some(200), "<html>ok</html>"), BlockSignal::Ok);
        assert_eq!(detect_block(Some(429), ""), BlockSignal::Http429);
        assert_eq!(detect_block(Some(403), ""), BlockSignal::Http403);
        assert_eq!(
            detect_block(Some(200), "Por favor digite os caracteres"),
            BlockSignal::Captcha
        );
        assert_eq!(detect_block(Some(403), "CAPTCHA required"), BlockSignal::Captcha);
        assert_eq!(detect_block(None, ""), BlockSignal::Unknown);
    }

    fn recovery(kv: Arc<MemoryKv>) -> BlockRecovery {
        BlockRecovery::new(
            kv,
            Arc::new(Metrics::new()),
            Arc::new(UserAgentManager::default()),
            Arc::new(CookieManager::new()),
            Arc::new(Mutex::new(HumanizedDelay::with_params(200.0, 1.0, (0.0, 0.0)))),
            Arc::new(BrowserClient::new(None, 30)),
        )
    }

    #[tokio::test]
    async fn test_escalating_suspension_steps() {
        let kv = Arc::new(MemoryKv::new());
        let rec = recovery(kv.clone());

        rec.handle_block(BlockSignal::Http429, None, None).await;
        let ttl = kv.ttl(SCRAPING_SUSPENDED_KEY).await.unwrap();
        assert!(ttl > 0 && ttl <= 300, "ttl {}", ttl);
        assert_eq!(rec.severity(), 1);

        rec.handle_block(BlockSignal::Http429, None, None).await;
        let ttl = kv.ttl(SCRAPING_SUSPENDED_KEY).await.unwrap();
        assert!(ttl > 300 && ttl <= 900, "ttl {}", ttl);

        rec.handle_block(BlockSignal::Http429, None, None).await;
        let ttl = kv.ttl(SCRAPING_SUSPENDED_KEY).await.unwrap();
        assert!(ttl > 900 && ttl <= 1800, "ttl {}", ttl);
        assert_eq!(rec.severity(), 3);

        // Steps saturate at the last entry.
        rec.handle_block(BlockSignal::Http429, None, None).await;
        let ttl = kv.ttl(SCRAPING_SUSPENDED_KEY).await.unwrap();
        assert!(ttl > 900 && ttl <= 1800, "ttl {}", ttl);
    }

    #[tokio::test]
    async fn test_captcha_jumps_to_top_severity() {
        let kv = Arc::new(MemoryKv::new());
        let rec = recovery(kv.clone());
        rec.handle_block(BlockSignal::Captcha, Some("s1"), None).await;
        assert_eq!(rec.severity(), 3);
        let ttl = kv.ttl(SCRAPING_SUSPENDED_KEY).await.unwrap();
        assert!(ttl > 900 && ttl <= 1800, "ttl {}", ttl);
    }

    #[tokio::test]
    async fn test_delay_prolonged_each_pass() {
        let kv = Arc::new(MemoryKv::new());
        let delay = Arc::new(Mutex::new(HumanizedDelay::with_params(200.0, 1.0, (0.0, 0.0))));
        let rec = BlockRecovery::new(
            kv,
            Arc::new(Metrics::new()),
            Arc::new(UserAgentManager::default()),
            Arc::new(CookieManager::new()),
            delay.clone(),
            Arc::new(BrowserClient::new(None, 30)),
        );
        for _ in 0..3 {
            rec.handle_block(BlockSignal::Http429, None, None).await;
        }
        let base = delay.lock().base_delay();
        assert!((base - 1.5f64.powi(3)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reset_clears_severity() {
        let kv = Arc::new(MemoryKv::new());
        let rec = recovery(kv);
        rec.handle_block(BlockSignal::Http403, None, None).await;
        assert!(rec.severity() >= 2);
        rec.reset();
        assert_eq!(rec.severity(), 0);
    }
}
