//! Key-value plane shared by both services.
//!
//! Holds scheduler state, circuit state, rate-limiter windows, cache
//! entries, robots.txt cache, queue lanes and the global suspend flag.
//! `RedisKv` is the production backend; `MemoryKv` emulates the same
//! semantics (TTLs included) for unit tests. All mutations used for
//! coordination are atomic on the Redis side (INCR, scripted sliding
//! window, SET .. EX).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use crate::metrics::Metrics;

pub const SCRAPING_SUSPENDED_KEY: &str = "scraping:suspended";

/// Atomic sliding-window check: drop timestamps outside the window, record
/// this one, allow when the window population stays within the limit.
const SLIDING_WINDOW_LUA: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, tonumber(ARGV[1]) - tonumber(ARGV[2]))
redis.call('ZADD', KEYS[1], tonumber(ARGV[1]), ARGV[1])
redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))
local count = redis.call('ZCARD', KEYS[1])
if count <= tonumber(ARGV[3]) then
  return 1
else
  return 0
end
"#;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// SET without expiration (TTL −1).
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// SET with expiration in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Remaining TTL in seconds: −2 missing, −1 no expiration.
    async fn ttl(&self, key: &str) -> Result<i64>;
    /// Keys matching a glob-style pattern (trailing `*` only).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Sliding-window rate limit; true when the request is allowed.
    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<bool>;

    // Queue lanes (lists) and delayed tasks (sorted set).
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    async fn lpop(&self, key: &str) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<i64>;
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    /// Pop every member with score ≤ `max_score`.
    async fn zpop_due(&self, key: &str, max_score: f64) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed store used in production.
#[derive(Clone)]
pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
    window_script: Arc<redis::Script>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("redis connection failed")?;
        Ok(Self {
            manager,
            window_script: Arc::new(redis::Script::new(SLIDING_WINDOW_LUA)),
        })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.ttl(key).await?)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<bool> {
        let mut conn = self.manager.clone();
        let allowed: i64 = self
            .window_script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(allowed == 1)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.lpop(key, None).await?)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        Ok(conn.llen(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zpop_due(&self, key: &str, max_score: f64) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let due: Vec<String> = conn.zrangebyscore(key, f64::MIN, max_score).await?;
        if !due.is_empty() {
            conn.zrem::<_, _, ()>(key, &due).await?;
        }
        Ok(due)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    strings: HashMap<String, MemoryEntry>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    windows: HashMap<String, Vec<u64>>,
}

/// In-process store used by unit tests. Mirrors the TTL semantics of the
/// Redis backend, including TTL −1 for keys written without expiration.
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge(inner: &mut MemoryInner, key: &str) {
        if inner.strings.get(key).map(|e| e.expired()).unwrap_or(false) {
            inner.strings.remove(key);
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        Self::purge(&mut inner, key);
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().strings.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.inner.lock().strings.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        Self::purge(&mut inner, key);
        let next = match inner.strings.get(key) {
            Some(entry) => entry.value.parse::<i64>().unwrap_or(0) + 1,
            None => 1,
        };
        let expires_at = inner.strings.get(key).and_then(|e| e.expires_at);
        inner.strings.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.lists.remove(key);
        inner.zsets.remove(key);
        inner.windows.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::purge(&mut inner, key);
        Ok(inner.strings.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock();
        Self::purge(&mut inner, key);
        match inner.strings.get(key) {
            None => Ok(-2),
            Some(entry) => match entry.expires_at {
                None => Ok(-1),
                Some(at) => Ok((at - Instant::now()).as_secs_f64().round() as i64),
            },
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            Self::purge(&mut inner, key);
        }
        Ok(inner
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let window = inner.windows.entry(key.to_string()).or_default();
        window.retain(|&ts| ts > now_ms.saturating_sub(window_ms));
        window.push(now_ms);
        Ok(window.len() as u64 <= limit)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .lists
            .get_mut(key)
            .and_then(|list| list.pop_front()))
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .lists
            .get(key)
            .map(|l| l.len() as i64)
            .unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        zset.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zpop_due(&self, key: &str, max_score: f64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let due: Vec<String> = zset
            .iter()
            .filter(|(score, _)| *score <= max_score)
            .map(|(_, m)| m.clone())
            .collect();
        zset.retain(|(score, _)| *score > max_score);
        Ok(due)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Checks the global suspension flag, updating the gauge as a side effect.
pub async fn is_scraping_suspended(kv: &dyn KvStore, metrics: &Metrics) -> bool {
    let active = kv.exists(SCRAPING_SUSPENDED_KEY).await.unwrap_or(false);
    metrics.scraping_suspended_flag.set(if active { 1.0 } else { 0.0 });
    active
}

/// Raises the global suspension flag for `duration_secs`.
pub async fn suspend_scraping(kv: &dyn KvStore, metrics: &Metrics, duration_secs: u64) {
    if kv
        .set_ex(SCRAPING_SUSPENDED_KEY, "1", duration_secs)
        .await
        .is_ok()
    {
        metrics.scraping_suspended_flag.set(1.0);
    }
}

/// Clears the suspension flag immediately.
pub async fn resume_scraping(kv: &dyn KvStore, metrics: &Metrics) {
    if kv.del(SCRAPING_SUSPENDED_KEY).await.is_ok() {
        metrics.scraping_suspended_flag.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_get_del() {
        let kv = MemoryKv::new();
        kv.set("a", "1").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.ttl("a").await.unwrap(), -1);
        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.ttl("a").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_memory_ttl_reported() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", 3600).await.unwrap();
        assert_eq!(kv.ttl("k").await.unwrap(), 3600);
        assert!(kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_incr_preserves_ttl() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("c").await.unwrap(), 1);
        kv.expire("c", 600).await.unwrap();
        assert_eq!(kv.incr("c").await.unwrap(), 2);
        assert_eq!(kv.incr("c").await.unwrap(), 3);
        let ttl = kv.ttl("c").await.unwrap();
        assert!(ttl > 0 && ttl <= 600);
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let kv = MemoryKv::new();
        kv.set_ex("gone", "v", 0).await.unwrap();
        assert_eq!(kv.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sliding_window_limit() {
        let kv = MemoryKv::new();
        let mut allowed = 0;
        for i in 0..10u64 {
            if kv.sliding_window("rl", 1000 + i, 60_000, 5).await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
        // Outside the window the limiter admits again.
        assert!(kv.sliding_window("rl", 70_000, 60_000, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_zset_ops() {
        let kv = MemoryKv::new();
        kv.rpush("q", "a").await.unwrap();
        kv.rpush("q", "b").await.unwrap();
        assert_eq!(kv.llen("q").await.unwrap(), 2);
        assert_eq!(kv.lpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(kv.lpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(kv.lpop("q").await.unwrap(), None);

        kv.zadd("eta", "t1", 100.0).await.unwrap();
        kv.zadd("eta", "t2", 200.0).await.unwrap();
        let due = kv.zpop_due("eta", 150.0).await.unwrap();
        assert_eq!(due, vec!["t1".to_string()]);
        let rest = kv.zpop_due("eta", 500.0).await.unwrap();
        assert_eq!(rest, vec!["t2".to_string()]);
    }

    #[tokio::test]
    async fn test_suspend_helpers() {
        let kv = MemoryKv::new();
        let metrics = Metrics::new();
        assert!(!is_scraping_suspended(&kv, &metrics).await);
        suspend_scraping(&kv, &metrics, 300).await;
        assert!(is_scraping_suspended(&kv, &metrics).await);
        assert!((metrics.scraping_suspended_flag.get() - 1.0).abs() < f64::EPSILON);
        resume_scraping(&kv, &metrics).await;
        assert!(!is_scraping_suspended(&kv, &metrics).await);
    }
}
