//! Sliding-window rate limiting over the KV store.
//!
//! The window is a sorted set of millisecond timestamps trimmed and counted
//! atomically (a Lua script on the Redis backend), so the limit holds
//! across processes.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::kv::KvStore;

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    key: String,
    limit: u64,
    window_ms: u64,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>, max_requests: u64, window_seconds: u64) -> Self {
        Self {
            kv,
            key: key.into(),
            limit: max_requests,
            window_ms: window_seconds * 1000,
        }
    }

    fn format_key(&self, identifier: Option<&str>) -> String {
        match identifier {
            Some(id) => format!("{}:{}", self.key, id),
            None => self.key.clone(),
        }
    }

    /// True when the request fits in the window. Sub-limits (per user, per
    /// endpoint) are expressed through `identifier`.
    pub async fn allow_request(&self, identifier: Option<&str>) -> Result<bool> {
        let key = self.format_key(identifier);
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.kv
            .sliding_window(&key, now_ms, self.window_ms, self.limit)
            .await
    }

    /// Clears the limiter state entirely.
    pub async fn reset(&self, identifier: Option<&str>) -> Result<()> {
        self.kv.del(&self.format_key(identifier)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn test_limit_enforced_within_window() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = RateLimiter::new(kv, "rate:test", 3, 60);
        let mut allowed = 0;
        for _ in 0..8 {
            if limiter.allow_request(None).await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn test_identifier_scopes_are_independent() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = RateLimiter::new(kv, "rate:test", 1, 60);
        assert!(limiter.allow_request(Some("a")).await.unwrap());
        assert!(!limiter.allow_request(Some("a")).await.unwrap());
        assert!(limiter.allow_request(Some("b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_reopens_window() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = RateLimiter::new(kv, "rate:test", 1, 60);
        assert!(limiter.allow_request(None).await.unwrap());
        assert!(!limiter.allow_request(None).await.unwrap());
        limiter.reset(None).await.unwrap();
        assert!(limiter.allow_request(None).await.unwrap());
    }
}
