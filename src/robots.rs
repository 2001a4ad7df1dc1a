//! Resilient robots.txt lookup with KV caching.
//!
//! Only the Crawl-delay directive matters here; it is folded into the
//! throttle jitter band before a fetch. Failures degrade to "no directive"
//! so scraping never stalls on a missing robots.txt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::kv::KvStore;

const ROBOTS_CACHE_KEY: &str = "robots.txt:content";

pub struct RobotsTxt {
    kv: Arc<dyn KvStore>,
    http: reqwest::Client,
    cache_ttl: u64,
}

impl RobotsTxt {
    pub fn new(kv: Arc<dyn KvStore>, cache_ttl: u64) -> Self {
        Self {
            kv,
            http: reqwest::Client::new(),
            cache_ttl,
        }
    }

    fn origin(url: &str) -> Option<String> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        Some(format!("{}://{}", parsed.scheme(), host))
    }

    /// Crawl-delay in seconds for the agent, falling back to the wildcard
    /// block. None when the file is missing or silent.
    pub async fn crawl_delay(&self, url: &str, user_agent: &str) -> Option<f64> {
        let origin = Self::origin(url)?;
        let content = self.fetch_robots(&origin).await;
        let delays = parse_crawl_delays(&content);
        delays
            .get(user_agent)
            .or_else(|| delays.get("*"))
            .copied()
    }

    async fn fetch_robots(&self, origin: &str) -> String {
        let cache_key = format!("{}:{}", ROBOTS_CACHE_KEY, origin);
        if let Ok(Some(cached)) = self.kv.get(&cache_key).await {
            return cached;
        }

        let url = format!("{}/robots.txt", origin);
        let content = match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            Ok(_) => String::new(),
            Err(err) => {
                warn!(url, error = %err, "robots fetch failed");
                String::new()
            }
        };

        if let Err(err) = self.kv.set_ex(&cache_key, &content, self.cache_ttl).await {
            warn!(origin, error = %err, "robots cache write failed");
        }
        content
    }
}

/// Extracts Crawl-delay values per user-agent block.
pub fn parse_crawl_delays(text: &str) -> HashMap<String, f64> {
    let agent_re = Regex::new(r"(?i)^User-agent:\s*(.+)$").expect("static regex");
    let delay_re = Regex::new(r"(?i)^Crawl-delay:\s*([0-9]+(?:\.[0-9]+)?)$").expect("static regex");

    let mut delays = HashMap::new();
    let mut current_agents: Vec<String> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = agent_re.captures(line) {
            current_agents = vec![caps[1].trim().to_string()];
            continue;
        }
        if let Some(caps) = delay_re.captures(line) {
            if let Ok(value) = caps[1].parse::<f64>() {
                for agent in &current_agents {
                    delays.insert(agent.clone(), value);
                }
            }
        }
    }
    delays
}
