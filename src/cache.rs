//! Content cache with adaptive TTL.
//!
//! Stores the parsed payload, a SHA-256 of the raw HTML and the ETag per
//! URL. When the same content is seen repeatedly the TTL multiplier grows,
//! suppressing redundant scraping work.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::kv::KvStore;
use crate::metrics::Metrics;

const CACHE_PREFIX: &str = "cache:product:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub hash: String,
    pub etag: Option<String>,
    pub multiplier: u32,
}

pub struct ContentCache {
    kv: Arc<dyn KvStore>,
    metrics: Arc<Metrics>,
    base_ttl: u64,
    max_multiplier: u32,
}

impl ContentCache {
    pub fn new(kv: Arc<dyn KvStore>, metrics: Arc<Metrics>, base_ttl: u64, max_multiplier: u32) -> Self {
        Self {
            kv,
            metrics,
            base_ttl,
            max_multiplier,
        }
    }

    fn key(url: &str) -> String {
        format!("{}{}", CACHE_PREFIX, url)
    }

    pub fn hash_content(content: &str) -> String {
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    /// Full cache entry for the URL, or None.
    pub async fn get(&self, url: &str) -> Option<CacheEntry> {
        let raw = self.kv.get(&Self::key(url)).await.ok().flatten()?;
        serde_json::from_str(&raw).ok()
    }

    /// Only the stored payload.
    pub async fn get_data(&self, url: &str) -> Option<serde_json::Value> {
        self.get(url).await.map(|entry| entry.data)
    }

    /// Stores the payload; repeated identical HTML stretches the TTL up to
    /// `base_ttl × max_multiplier`, any change resets the multiplier.
    pub async fn set(
        &self,
        url: &str,
        data: serde_json::Value,
        content: &str,
        etag: Option<String>,
    ) -> Result<()> {
        let content_hash = Self::hash_content(content);
        let multiplier = match self.get(url).await {
            Some(prior) if prior.hash == content_hash => {
                (prior.multiplier + 1).min(self.max_multiplier)
            }
            _ => 1,
        };

        let ttl = self.base_ttl * multiplier as u64;
        let entry = CacheEntry {
            data,
            hash: content_hash,
            etag,
            multiplier,
        };
        self.kv
            .set_ex(&Self::key(url), &serde_json::to_string(&entry)?, ttl)
            .await
    }

    pub async fn invalidate(&self, url: &str) -> Result<()> {
        self.kv.del(&Self::key(url)).await
    }

    /// Remaining TTL for the URL's entry (KV semantics: −2 missing, −1 no
    /// expiration).
    pub async fn ttl(&self, url: &str) -> i64 {
        self.kv.ttl(&Self::key(url)).await.unwrap_or(-2)
    }

    /// Record a cache hit/miss against the counters.
    pub fn record_hit(&self, endpoint: Option<&str>) {
        self.metrics.cache_hits_total.fetch_add(1, Ordering::Relaxed);
        if let Some(endpoint) = endpoint {
            self.metrics.cache_hits_endpoint_total.inc(endpoint);
        }
    }

    pub fn record_miss(&self, endpoint: Option<&str>) {
        self.metrics.cache_misses_total.fetch_add(1, Ordering::Relaxed);
        if let Some(endpoint) = endpoint {
            self.metrics.cache_misses_endpoint_total.inc(endpoint);
        }
    }

    /// Deletes entries stored without expiration (a bug write) and returns
    /// how many were removed. Runs from the daily cleanup task.
    pub async fn cleanup(&self) -> usize {
        let pattern = format!("{}*", CACHE_PREFIX);
        let keys = match self.kv.scan_keys(&pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "cache cleanup scan failed");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            if let Ok(-1) = self.kv.ttl(&key).await {
                if self.kv.del(&key).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "cache cleanup removed persistent entries");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    fn cache(kv: Arc<MemoryKv>) -> ContentCache {
        ContentCache::new(kv, Arc::new(Metrics::new()), 3600, 5)
    }

    #[tokio::test]
    async fn test_ttl_grows_with_identical_html() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv);
        let data = json!({"current_price": "R$ 10,00"});

        cache.set("u", data.clone(), "<html/>", None).await.unwrap();
        assert_eq!(cache.ttl("u").await, 3600);

        cache.set("u", data.clone(), "<html/>", None).await.unwrap();
        assert_eq!(cache.ttl("u").await, 7200);

        cache.set("u", data.clone(), "<html/>", None).await.unwrap();
        assert_eq!(cache.ttl("u").await, 10800);

        // Different HTML resets the multiplier.
        cache.set("u", data, "<html>changed</html>", None).await.unwrap();
        assert_eq!(cache.ttl("u").await, 3600);
        assert_eq!(cache.get("u").await.unwrap().multiplier, 1);
    }

    #[tokio::test]
    async fn test_multiplier_capped() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv);
        for _ in 0..8 {
            cache.set("u", json!({}), "same", None).await.unwrap();
        }
        let entry = cache.get("u").await.unwrap();
        assert_eq!(entry.multiplier, 5);
        assert_eq!(cache.ttl("u").await, 3600 * 5);
    }

    #[tokio::test]
    async fn test_entry_round_trip() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv);
        cache
            .set("u", json!({"name": "tv"}), "<html/>", Some("abc".into()))
            .await
            .unwrap();
        let entry = cache.get("u").await.unwrap();
        assert_eq!(entry.data["name"], "tv");
        assert_eq!(entry.etag.as_deref(), Some("abc"));
        assert_eq!(entry.hash, ContentCache::hash_content("<html/>"));
        assert_eq!(cache.get_data("u").await.unwrap()["name"], "tv");

        cache.invalidate("u").await.unwrap();
        assert!(cache.get("u").await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_persistent_entries() {
        let kv = Arc::new(MemoryKv::new());
        let cache = cache(kv.clone());
        cache.set("ok", json!({}), "x", None).await.unwrap();
        // Simulate the bug write without a TTL.
        kv.set("cache:product:stale", "{\"data\":{},\"hash\":\"h\",\"etag\":null,\"multiplier\":1}")
            .await
            .unwrap();

        let removed = cache.cleanup().await;
        assert_eq!(removed, 1);
        assert!(cache.get("ok").await.is_some());
        assert!(kv.get("cache:product:stale").await.unwrap().is_none());
    }
}
