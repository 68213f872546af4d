//! Read-through TTL cache in front of third-party enrichment lookups.
//!
//! - Hit within TTL: cached value, no I/O.
//! - Miss or expired: fetcher runs under a bounded timeout.
//! - Fetch failure or timeout: [`Lookup::Unknown`] is returned (never an
//!   error), counted as degraded, and remembered for the negative TTL.
//! - Capacity pressure evicts the least recently used entry ([`LruCache`]).
//!
//! Entries are replaced whole under the lock and the lock is never held across
//! an `.await`, so concurrent population of one key is last-write-wins.

use std::fmt::Display;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CacheSettings;

/// Result of a cached lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Known(V),
    /// The third party failed or timed out; callers treat this as the `-1`
    /// sentinel, not as an error.
    Unknown,
}

impl<V> Lookup<V> {
    pub fn known(self) -> Option<V> {
        match self {
            Lookup::Known(v) => Some(v),
            Lookup::Unknown => None,
        }
    }

    pub fn as_known(&self) -> Option<&V> {
        match self {
            Lookup::Known(v) => Some(v),
            Lookup::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Lookup::Unknown)
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Lookup<U> {
        match self {
            Lookup::Known(v) => Lookup::Known(f(v)),
            Lookup::Unknown => Lookup::Unknown,
        }
    }
}

/// Why a lookup degraded to unknown. Internal only: logged and counted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LookupDegraded {
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("lookup failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub timeout: Duration,
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        Self {
            capacity: s.capacity.max(1),
            ttl: s.ttl(),
            negative_ttl: s.negative_ttl(),
            timeout: s.lookup_timeout(),
        }
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: Lookup<V>,
    fetched_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn fresh(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) < self.ttl
    }
}

/// One cache per lookup type (domain registration, TLS, geo-IP, ...).
pub struct LookupCache<V> {
    name: &'static str,
    cfg: CacheConfig,
    entries: Mutex<LruCache<String, Entry<V>>>,
}

impl<V: Clone> LookupCache<V> {
    pub fn new(name: &'static str, cfg: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(cfg.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            cfg,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.cfg.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh cached value, if any. A hit promotes the entry; a stale entry is
    /// dropped.
    pub fn peek(&self, key: &str) -> Option<Lookup<V>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.fresh(now) => Some(e.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Read-through lookup with the cache's default TTL.
    pub async fn get<F, Fut, E>(&self, key: &str, fetcher: F) -> Lookup<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        self.get_or_fetch(key, fetcher, self.cfg.ttl).await
    }

    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetcher: F, ttl: Duration) -> Lookup<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        if let Some(hit) = self.peek(key) {
            counter!("lookup_cache_hits_total", "lookup" => self.name).increment(1);
            return hit;
        }
        counter!("lookup_cache_misses_total", "lookup" => self.name).increment(1);

        let outcome = match tokio::time::timeout(self.cfg.timeout, fetcher()).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(LookupDegraded::Failed(e.to_string())),
            Err(_) => Err(LookupDegraded::Timeout(self.cfg.timeout)),
        };

        match outcome {
            Ok(v) => {
                self.insert(key, Lookup::Known(v.clone()), ttl);
                Lookup::Known(v)
            }
            Err(degraded) => {
                counter!("lookup_degraded_total", "lookup" => self.name).increment(1);
                tracing::warn!(lookup = self.name, key = %key, reason = %degraded, "lookup degraded to unknown");
                if !self.cfg.negative_ttl.is_zero() {
                    self.insert(key, Lookup::Unknown, self.cfg.negative_ttl);
                }
                Lookup::Unknown
            }
        }
    }

    fn insert(&self, key: &str, value: Lookup<V>, ttl: Duration) {
        let entry = Entry {
            value,
            fetched_at: Instant::now(),
            ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cfg(capacity: usize) -> CacheConfig {
        CacheConfig {
            capacity,
            ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(5),
            timeout: Duration::from_millis(200),
        }
    }

    async fn counted(calls: &AtomicUsize, v: u32) -> Result<u32, String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(v)
    }

    #[tokio::test(start_paused = true)]
    async fn hit_within_ttl_does_not_refetch() {
        let cache = LookupCache::new("test", cfg(8));
        let calls = AtomicUsize::new(0);

        let a = cache.get("example.com", || counted(&calls, 7)).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        let b = cache.get("example.com", || counted(&calls, 8)).await;

        assert_eq!(a, Lookup::Known(7));
        assert_eq!(b, Lookup::Known(7), "same value inside TTL");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refetched() {
        let cache = LookupCache::new("test", cfg(8));
        let calls = AtomicUsize::new(0);

        cache.get("example.com", || counted(&calls, 1)).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let v = cache.get("example.com", || counted(&calls, 2)).await;

        assert_eq!(v, Lookup::Known(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_yields_unknown_and_is_negatively_cached() {
        let cache: LookupCache<u32> = LookupCache::new("test", cfg(8));
        let calls = AtomicUsize::new(0);

        let v = cache
            .get("bad.example", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>("registry returned 503")
            })
            .await;
        assert_eq!(v, Lookup::Unknown);

        // Remembered for the negative TTL.
        let again = cache.get("bad.example", || counted(&calls, 9)).await;
        assert_eq!(again, Lookup::Unknown);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let later = cache.get("bad.example", || counted(&calls, 9)).await;
        assert_eq!(later, Lookup::Known(9));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetcher_times_out_to_unknown() {
        let cache: LookupCache<u32> = LookupCache::new("test", cfg(8));
        let v = cache
            .get("slow.example", || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<u32, String>(1)
            })
            .await;
        assert_eq!(v, Lookup::Unknown);
    }

    #[tokio::test]
    async fn zero_negative_ttl_disables_failure_caching() {
        let mut c = cfg(8);
        c.negative_ttl = Duration::ZERO;
        let cache: LookupCache<u32> = LookupCache::new("test", c);
        cache
            .get("x", || async { Err::<u32, _>("nope") })
            .await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_pressure_evicts_least_recently_used() {
        let cache = LookupCache::new("test", cfg(2));
        let calls = AtomicUsize::new(0);

        cache.get("a", || counted(&calls, 1)).await;
        cache.get("b", || counted(&calls, 2)).await;
        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.peek("a").is_some());
        cache.get("c", || counted(&calls, 3)).await;

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("a").is_some());
        assert!(cache.peek("b").is_none());
        assert!(cache.peek("c").is_some());
    }

    #[tokio::test]
    async fn size_stays_bounded_and_keeps_the_newest_keys() {
        let cache = LookupCache::new("test", cfg(8));
        let calls = AtomicUsize::new(0);
        for i in 0..100u32 {
            cache.get(&format!("host-{i}"), || counted(&calls, i)).await;
        }
        assert_eq!(cache.len(), 8);
        assert!(cache.peek("host-99").is_some());
        assert!(cache.peek("host-92").is_some());
        assert!(cache.peek("host-91").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_dropped_on_read() {
        let cache = LookupCache::new("test", cfg(8));
        let calls = AtomicUsize::new(0);
        cache.get("old.example", || counted(&calls, 1)).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.peek("old.example").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_population_of_one_key_is_whole_value() {
        let cache = Arc::new(LookupCache::new("test", cfg(8)));
        let mut handles = Vec::new();
        for i in 0..16u32 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move {
                c.get("shared", || async move { Ok::<_, String>((i, i * 2)) }).await
            }));
        }
        for h in handles {
            if let Lookup::Known((a, b)) = h.await.unwrap() {
                assert_eq!(b, a * 2, "value never half-written");
            }
        }
        assert_eq!(cache.len(), 1);
    }
}
