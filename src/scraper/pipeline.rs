//! The scraper service's fetch pipeline.
//!
//! Order per request: service rate limit → global suspend → per-URL
//! circuit → robots pacing → humanized delay + token bucket → fetch →
//! block detection/recovery → content cache → parse → cache update, with
//! an audit record at every stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::blockguard::{detect_block, BlockRecovery, BlockSignal};
use crate::cache::ContentCache;
use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::error::ScrapeError;
use crate::identity::{CookieManager, UserAgentManager, STEALTH_HEADERS};
use crate::kv::{is_scraping_suspended, KvStore};
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::robots::RobotsTxt;
use crate::throttle::{parse_retry_after, HumanizedDelay, ThrottleManager};

use super::client::{ProductKind, ScrapedDetails};
use super::parser::{parse_optional_price_str, parse_price_str, ParsedDetails, ParserError, ProductParser};
use super::urls::{extract_hostname, to_mobile_url};

/// One fetched page with the response attributes the pipeline needs.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
    pub etag: Option<String>,
    pub retry_after: Option<String>,
    pub set_cookies: Vec<String>,
}

#[async_trait]
pub trait HtmlFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        user_agent: &str,
        cookie_header: &str,
    ) -> Result<FetchedPage, ScrapeError>;
}

/// reqwest fetcher with the stealth header set.
pub struct HttpFetcher {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(cfg.fetch_timeout_secs),
        }
    }
}

#[async_trait]
impl HtmlFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        user_agent: &str,
        cookie_header: &str,
    ) -> Result<FetchedPage, ScrapeError> {
        let mut request = self
            .http
            .get(url)
            .timeout(self.timeout)
            .header("User-Agent", user_agent)
            .header("Cookie", cookie_header);
        for (name, value) in STEALTH_HEADERS {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ScrapeError::TransientRemote(format!("fetch timeout for {}", url))
            } else {
                ScrapeError::TransientRemote(format!("fetch failed for {}: {}", url, e))
            }
        })?;

        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let set_cookies = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::TransientRemote(format!("body read failed: {}", e)))?;

        Ok(FetchedPage {
            status,
            body,
            etag,
            retry_after,
            set_cookies,
        })
    }
}

pub struct ScraperPipeline {
    kv: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    cache: Arc<ContentCache>,
    circuit: Arc<CircuitBreaker>,
    robots: Arc<RobotsTxt>,
    ua_manager: Arc<UserAgentManager>,
    cookie_manager: Arc<CookieManager>,
    delay: Arc<Mutex<HumanizedDelay>>,
    recovery: Arc<BlockRecovery>,
    fetcher: Arc<dyn HtmlFetcher>,
    parser: Arc<dyn ProductParser>,
    audit: Arc<AuditLog>,
    throttle: AsyncMutex<ThrottleManager>,
    monitored_limiter: RateLimiter,
    competitor_limiter: RateLimiter,
}

impl ScraperPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        kv: Arc<dyn KvStore>,
        metrics: Arc<Metrics>,
        cache: Arc<ContentCache>,
        circuit: Arc<CircuitBreaker>,
        robots: Arc<RobotsTxt>,
        ua_manager: Arc<UserAgentManager>,
        cookie_manager: Arc<CookieManager>,
        delay: Arc<Mutex<HumanizedDelay>>,
        recovery: Arc<BlockRecovery>,
        fetcher: Arc<dyn HtmlFetcher>,
        parser: Arc<dyn ProductParser>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let throttle = AsyncMutex::new(ThrottleManager::new(&cfg));
        let monitored_limiter = RateLimiter::new(
            kv.clone(),
            "monitored",
            cfg.monitored_rate_limit,
            cfg.rate_limit_window,
        );
        let competitor_limiter = RateLimiter::new(
            kv.clone(),
            "competitor",
            cfg.competitor_service_rate_limit,
            cfg.rate_limit_window,
        );
        Self {
            kv,
            metrics,
            cache,
            circuit,
            robots,
            ua_manager,
            cookie_manager,
            delay,
            recovery,
            fetcher,
            parser,
            audit,
            throttle,
            monitored_limiter,
            competitor_limiter,
        }
    }

    fn endpoint_label(kind: ProductKind) -> &'static str {
        match kind {
            ProductKind::Monitored => "monitored_scrape",
            ProductKind::Competitor => "competitor_scrape",
        }
    }

    fn fail_status(&self, host: &str) {
        self.metrics
            .scraper_url_status_total
            .inc(&format!("{}_failure", host));
    }

    fn ok_status(&self, host: &str) {
        self.metrics
            .scraper_url_status_total
            .inc(&format!("{}_success", host));
    }

    fn to_response(&self, parsed: &ParsedDetails, url: &str) -> Result<ScrapedDetails, ScrapeError> {
        let raw_price = parsed
            .current_price
            .as_deref()
            .ok_or_else(|| ScrapeError::ParsingFailed(format!("price not found in {}", url)))?;
        let current_price = parse_price_str(raw_price, url)?;
        let old_price = parse_optional_price_str(parsed.old_price.as_deref(), url)?;
        Ok(ScrapedDetails {
            name: parsed.name.clone(),
            current_price: current_price.to_f64().unwrap_or_default(),
            old_price: old_price.and_then(|p| p.to_f64()),
            thumbnail: parsed.thumbnail.clone(),
            free_shipping: parsed.shipping.as_deref() == Some("Frete Grátis"),
            seller: parsed.seller.clone(),
            shipping: parsed.shipping.clone(),
        })
    }

    /// Runs the full fetch-parse pipeline for one URL.
    pub async fn scrape(&self, url: &str, kind: ProductKind) -> Result<ScrapedDetails, ScrapeError> {
        let payload = json!({"url": url, "product_type": Self::endpoint_label(kind)});
        let limiter = match kind {
            ProductKind::Monitored => &self.monitored_limiter,
            ProductKind::Competitor => &self.competitor_limiter,
        };

        let target_url = to_mobile_url(url);
        let host = extract_hostname(&target_url);
        let circuit_key = format!("scrape:{}", url);
        let session_id = host.clone();

        if is_scraping_suspended(self.kv.as_ref(), &self.metrics).await {
            warn!(url, "scraping suspended via flag");
            self.fail_status(&host);
            return Err(ScrapeError::RateLimited(format!(
                "scraping temporarily suspended for {}",
                url
            )));
        }

        if !self.circuit.allow_request(&circuit_key).await {
            warn!(url, "circuit open, skipping fetch");
            self.fail_status(&host);
            return Err(ScrapeError::RateLimited(format!(
                "scraping suspended after repeated failures on {}",
                url
            )));
        }

        if !limiter.allow_request(None).await.unwrap_or(false) {
            let _ = self.circuit.record_failure(&circuit_key).await;
            self.fail_status(&host);
            return Err(ScrapeError::RateLimited("rate limit exceeded".into()));
        }

        // Robots.txt Crawl-delay widens the pacing jitter for this request.
        let crawl_delay = self.robots.crawl_delay(url, "*").await;

        let pre_wait = self.delay.lock().calculate_delay(None, 1.0);
        tokio::time::sleep(Duration::from_secs_f64(pre_wait)).await;
        {
            let mut throttle = self.throttle.lock().await;
            if let Some(delay) = crawl_delay {
                throttle.set_jitter_range(delay * 0.5, delay * 1.5);
            }
            throttle.wait(&self.metrics).await;
        }

        let user_agent = self.ua_manager.get_user_agent(&session_id);
        let cookie_header = self.cookie_manager.cookie_header(&session_id);

        let mut page_etag: Option<String> = None;
        let mut html = match self.fetcher.fetch(&target_url, &user_agent, &cookie_header).await {
            Ok(page) => {
                self.cookie_manager
                    .update_from_response(&session_id, &page.set_cookies);
                page_etag = page.etag.clone();
                self.metrics
                    .scraper_requests_total
                    .inc(&page.status.to_string());

                match detect_block(Some(page.status), &page.body) {
                    BlockSignal::Ok => {
                        self.audit.record(
                            "get",
                            &target_url,
                            payload.clone(),
                            Some(&page.body),
                            None,
                            None,
                        );
                        page.body
                    }
                    signal => {
                        let _ = self.circuit.record_failure(&circuit_key).await;
                        self.metrics
                            .scraper_blocked_total
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                        // Retry-After replaces exponential backoff when sent.
                        if signal == BlockSignal::Http429 {
                            if let Some(delay) =
                                page.retry_after.as_deref().and_then(parse_retry_after)
                            {
                                tokio::time::sleep(Duration::from_secs(delay.min(30))).await;
                            } else {
                                self.throttle.lock().await.backoff(0, &self.metrics).await;
                            }
                        }

                        match self
                            .recovery
                            .handle_block(signal, Some(&session_id), Some(&target_url))
                            .await
                        {
                            Some(recovered) => {
                                self.audit.record(
                                    "block_recovered",
                                    &target_url,
                                    payload.clone(),
                                    None,
                                    None,
                                    None,
                                );
                                recovered
                            }
                            None => {
                                self.audit.record(
                                    "error",
                                    &target_url,
                                    payload.clone(),
                                    Some(&page.body),
                                    None,
                                    Some(signal.as_str()),
                                );
                                self.fail_status(&host);
                                return Err(ScrapeError::Blocked(format!(
                                    "{} blocked with {}",
                                    url,
                                    signal.as_str()
                                )));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                let _ = self.circuit.record_failure(&circuit_key).await;
                self.metrics
                    .scraper_blocked_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let message = err.to_string();
                let signal = if message.contains("403") {
                    BlockSignal::Http403
                } else {
                    BlockSignal::Http429
                };
                match self
                    .recovery
                    .handle_block(signal, Some(&session_id), Some(&target_url))
                    .await
                {
                    Some(recovered) => {
                        self.audit.record(
                            "block_recovered",
                            &target_url,
                            payload.clone(),
                            None,
                            None,
                            None,
                        );
                        recovered
                    }
                    None => {
                        self.audit.record(
                            "error",
                            &target_url,
                            payload.clone(),
                            None,
                            None,
                            Some(&message),
                        );
                        self.fail_status(&host);
                        return Err(err);
                    }
                }
            }
        };

        {
            let wait_secs = self.delay.lock().calculate_delay(Some(&html), 1.0);
            tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
        }

        // Unchanged content short-circuits parsing entirely.
        let endpoint = Self::endpoint_label(kind);
        if let Some(entry) = self.cache.get(&target_url).await {
            if entry.hash == ContentCache::hash_content(&html) {
                self.cache.record_hit(Some(endpoint));
                if let Ok(parsed) = serde_json::from_value::<ParsedDetails>(entry.data.clone()) {
                    self.audit.record(
                        "cache",
                        &target_url,
                        payload.clone(),
                        None,
                        Some(entry.data.clone()),
                        None,
                    );
                    let _ = self.circuit.record_success(&circuit_key).await;
                    self.recovery.reset();
                    self.ok_status(&host);
                    info!(url, "cache hit, content unchanged");
                    return self.to_response(&parsed, &target_url);
                }
            }
        }
        self.cache.record_miss(Some(endpoint));

        if !self.parser.looks_like_product_page(&html) {
            warn!(url, "page is not a product page");
            self.audit.record(
                "error",
                &target_url,
                payload.clone(),
                Some(&html),
                None,
                Some("not_product_page"),
            );
            self.fail_status(&host);
            return Err(ScrapeError::NotProductPage(format!(
                "{} is not a product page",
                url
            )));
        }

        let parsed = match self.parser.parse(&html, &target_url) {
            Ok(parsed) => parsed,
            Err(ParserError::Captcha) => {
                let _ = self.circuit.record_failure(&circuit_key).await;
                self.metrics
                    .scraper_captcha_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.audit.record(
                    "error",
                    &target_url,
                    payload.clone(),
                    Some(&html),
                    None,
                    Some("captcha"),
                );
                let Some(recovered) = self
                    .recovery
                    .handle_block(BlockSignal::Captcha, Some(&session_id), Some(&target_url))
                    .await
                else {
                    self.fail_status(&host);
                    return Err(ScrapeError::Blocked(format!("captcha on {}", url)));
                };
                html = recovered;
                self.audit.record(
                    "captcha_recovered",
                    &target_url,
                    payload.clone(),
                    Some(&html),
                    None,
                    None,
                );
                self.parser.parse(&html, &target_url).map_err(|err| {
                    self.fail_status(&host);
                    ScrapeError::ParsingFailed(format!(
                        "parse after captcha recovery failed: {}",
                        err
                    ))
                })?
            }
            Err(ParserError::Failed(message)) => {
                let _ = self.circuit.record_failure(&circuit_key).await;
                self.audit.record(
                    "error",
                    &target_url,
                    payload.clone(),
                    Some(&html),
                    None,
                    Some(&message),
                );
                self.fail_status(&host);
                return Err(ScrapeError::ParsingFailed(message));
            }
        };

        self.audit.record(
            "parser",
            &target_url,
            payload.clone(),
            None,
            serde_json::to_value(&parsed).ok(),
            None,
        );

        let response = self.to_response(&parsed, &target_url)?;

        if let Err(err) = self
            .cache
            .set(
                &target_url,
                serde_json::to_value(&parsed).unwrap_or_default(),
                &html,
                page_etag,
            )
            .await
        {
            warn!(url, error = %err, "cache update failed");
        }

        let _ = self.circuit.record_success(&circuit_key).await;
        self.recovery.reset();
        self.ok_status(&host);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, SCRAPING_SUSPENDED_KEY};
    use crate::scraper::parser::MeliParser;

    const PRODUCT_HTML: &str = r#"
        <h1 class="ui-pdp-title">Notebook</h1>
        <span class="andes-money-amount__fraction">1.234,56</span>
    "#;

    struct StubFetcher {
        page: FetchedPage,
    }

    #[async_trait]
    impl HtmlFetcher for StubFetcher {
        async fn fetch(&self, _url: &str, _ua: &str, _cookies: &str) -> Result<FetchedPage, ScrapeError> {
            Ok(self.page.clone())
        }
    }

    fn page(status: u16, body: &str) -> FetchedPage {
        FetchedPage {
            status,
            body: body.to_string(),
            etag: None,
            retry_after: None,
            set_cookies: Vec::new(),
        }
    }

    async fn pipeline(kv: Arc<MemoryKv>, fetch: FetchedPage, audit_dir: &std::path::Path) -> ScraperPipeline {
        let mut cfg = Config::default();
        // Deterministic, fast pacing for tests.
        cfg.jitter_min = 0.0;
        cfg.jitter_max = 0.0;
        cfg.throttle_rate = 1000.0;
        cfg.throttle_capacity = 10.0;
        cfg.human_base_delay = 0.0;
        cfg.human_fatigue_min = 0.0;
        cfg.human_fatigue_max = 0.0;
        let cfg = Arc::new(cfg);
        let metrics = Arc::new(Metrics::new());

        // Robots cache pre-seeded so no network call happens.
        kv.set_ex("robots.txt:content:https://m.mercadolivre.com.br", "", 3600)
            .await
            .unwrap();

        let ua = Arc::new(UserAgentManager::default());
        let cookies = Arc::new(CookieManager::new());
        let delay = Arc::new(Mutex::new(HumanizedDelay::new(&cfg)));
        let browser = Arc::new(crate::blockguard::BrowserClient::new(None, 1));
        let recovery = Arc::new(BlockRecovery::new(
            kv.clone(),
            metrics.clone(),
            ua.clone(),
            cookies.clone(),
            delay.clone(),
            browser,
        ));

        ScraperPipeline::new(
            cfg.clone(),
            kv.clone(),
            metrics.clone(),
            Arc::new(ContentCache::new(kv.clone(), metrics.clone(), 3600, 5)),
            Arc::new(CircuitBreaker::new(kv.clone(), metrics.clone(), &cfg)),
            Arc::new(RobotsTxt::new(kv.clone(), 3600)),
            ua,
            cookies,
            delay,
            recovery,
            Arc::new(StubFetcher { page: fetch }),
            Arc::new(MeliParser),
            Arc::new(AuditLog::new(audit_dir, metrics)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_scrape_parses_and_caches() {
        let kv = Arc::new(MemoryKv::new());
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(kv.clone(), page(200, PRODUCT_HTML), dir.path()).await;

        let url = "https://www.mercadolivre.com.br/MLB-1";
        let details = pipe.scrape(url, ProductKind::Monitored).await.unwrap();
        assert_eq!(details.name.as_deref(), Some("Notebook"));
        assert!((details.current_price - 1234.56).abs() < 1e-9);

        // Parsed payload cached under the mobile URL.
        let cached = kv
            .get("cache:product:https://m.mercadolivre.com.br/MLB-1")
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scrape_hits_cache() {
        let kv = Arc::new(MemoryKv::new());
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(kv.clone(), page(200, PRODUCT_HTML), dir.path()).await;
        let url = "https://www.mercadolivre.com.br/MLB-1";

        pipe.scrape(url, ProductKind::Monitored).await.unwrap();
        let miss_count = pipe.metrics.cache_misses_total.load(std::sync::atomic::Ordering::Relaxed);
        pipe.scrape(url, ProductKind::Monitored).await.unwrap();

        assert_eq!(
            pipe.metrics.cache_hits_total.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(
            pipe.metrics.cache_misses_total.load(std::sync::atomic::Ordering::Relaxed),
            miss_count
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_blocks_scrape() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_ex(SCRAPING_SUSPENDED_KEY, "1", 300).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(kv, page(200, PRODUCT_HTML), dir.path()).await;

        let err = pipe
            .scrape("https://www.mercadolivre.com.br/MLB-1", ProductKind::Monitored)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::RateLimited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_suspends_and_errors_without_browser() {
        let kv = Arc::new(MemoryKv::new());
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(kv.clone(), page(429, ""), dir.path()).await;

        let err = pipe
            .scrape("https://www.mercadolivre.com.br/MLB-1", ProductKind::Monitored)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Blocked(_)));
        // Global suspension raised by the recovery ladder.
        assert!(kv.exists(SCRAPING_SUSPENDED_KEY).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_product_page() {
        let kv = Arc::new(MemoryKv::new());
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(
            kv,
            page(200, "<html><div class=\"ui-search-results\">listing</div></html>"),
            dir.path(),
        )
        .await;

        let err = pipe
            .scrape("https://www.mercadolivre.com.br/MLB-1", ProductKind::Monitored)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::NotProductPage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_captcha_without_browser_is_blocked() {
        let kv = Arc::new(MemoryKv::new());
        let dir = tempfile::tempdir().unwrap();
        let html = r#"<h1 class="ui-pdp-title">x</h1><span class="andes-money-amount__fraction">1</span> digite os caracteres"#;
        let pipe = pipeline(kv.clone(), page(200, html), dir.path()).await;

        let err = pipe
            .scrape("https://www.mercadolivre.com.br/MLB-1", ProductKind::Monitored)
            .await
            .unwrap_err();
        // Captcha markers are caught by block detection on the 200 body.
        assert!(matches!(err, ScrapeError::Blocked(_)));
        assert!(kv.exists(SCRAPING_SUSPENDED_KEY).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_rate_limit() {
        let kv = Arc::new(MemoryKv::new());
        let dir = tempfile::tempdir().unwrap();
        let mut pipe = pipeline(kv.clone(), page(200, PRODUCT_HTML), dir.path()).await;
        pipe.monitored_limiter = RateLimiter::new(kv.clone(), "monitored", 1, 3600);

        let url = "https://www.mercadolivre.com.br/MLB-1";
        pipe.scrape(url, ProductKind::Monitored).await.unwrap();
        let err = pipe.scrape(url, ProductKind::Monitored).await.unwrap_err();
        assert!(matches!(err, ScrapeError::RateLimited(_)));
    }
}
