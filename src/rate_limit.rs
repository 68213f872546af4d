//! Fixed-window admission control keyed by (identity, endpoint).
//!
//! An analysis request must pass two windows: the per-kind window for the
//! requester and the global per-IP window. Both are checked and incremented
//! under one lock, and a rejected request consumes neither.

use std::collections::HashMap;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitSettings;
use crate::request::{AnalysisKind, UNKNOWN_IP};

/// Windows kept before a sweep of expired entries.
const PRUNE_THRESHOLD: usize = 4096;

/// Rate-limited endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Analysis(AnalysisKind),
    /// Every analysis kind together, keyed by IP.
    AnyAnalysis,
    /// Authentication endpoints, keyed by IP.
    Auth,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Analysis(kind) => kind.as_str(),
            Endpoint::AnyAnalysis => "ip_global",
            Endpoint::Auth => "auth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Limited {
        endpoint: Endpoint,
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u32,
}

type Key = (String, Endpoint);

#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimitSettings,
    window: Duration,
    windows: Mutex<HashMap<Key, Window>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimitSettings) -> Self {
        let window = limits.window().max(Duration::from_secs(1));
        Self {
            limits,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit_for(&self, endpoint: Endpoint) -> u32 {
        match endpoint {
            Endpoint::Analysis(kind) => self.limits.for_kind(kind),
            Endpoint::AnyAnalysis => self.limits.per_ip,
            Endpoint::Auth => self.limits.auth_per_ip,
        }
    }

    /// Admit one analysis of `kind` by `user_id` from `ip`.
    ///
    /// An unresolved address gets a window per requester; pooling every such
    /// caller under one key would let one of them exhaust the rest.
    pub fn check_analysis(&self, kind: AnalysisKind, user_id: &str, ip: &str) -> RateLimitResult {
        let ip_key = if ip == UNKNOWN_IP {
            format!("ip:{UNKNOWN_IP}:{user_id}")
        } else {
            format!("ip:{ip}")
        };
        self.admit(&[
            (format!("user:{user_id}"), Endpoint::Analysis(kind)),
            (ip_key, Endpoint::AnyAnalysis),
        ])
    }

    /// Admit one call to an authentication endpoint from `ip`.
    pub fn check_auth(&self, ip: &str) -> RateLimitResult {
        self.admit(&[(format!("ip:{ip}"), Endpoint::Auth)])
    }

    fn admit(&self, keys: &[Key]) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.start) < window);
        }

        // Check every window before touching any of them.
        for key in keys {
            let limit = self.limit_for(key.1);
            if let Some(w) = windows.get(key) {
                let elapsed = now.duration_since(w.start);
                if elapsed < self.window && w.count >= limit {
                    let endpoint = key.1;
                    counter!("risk_rate_limited_total", "endpoint" => endpoint.as_str())
                        .increment(1);
                    return RateLimitResult::Limited {
                        endpoint,
                        retry_after: self.window - elapsed,
                    };
                }
            }
        }

        for key in keys {
            let w = windows.entry(key.clone()).or_insert(Window {
                start: now,
                count: 0,
            });
            if now.duration_since(w.start) >= self.window {
                w.start = now;
                w.count = 0;
            }
            w.count += 1;
        }
        RateLimitResult::Allowed
    }

    /// Drop windows that have expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.window;
        self.windows
            .lock()
            .retain(|_, w| now.duration_since(w.start) < window);
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limits() -> RateLimitSettings {
        RateLimitSettings {
            window_secs: 60,
            text: 3,
            url: 15,
            transaction: 1,
            vishing: 5,
            customer_care: 10,
            per_ip: 100,
            auth_per_ip: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn n_plus_one_rejects_exactly_once_then_rollover_resets() {
        let rl = RateLimiter::new(limits());
        let results: Vec<_> = (0..4)
            .map(|_| rl.check_analysis(AnalysisKind::Text, "u1", "10.0.0.1"))
            .collect();
        let rejected = results.iter().filter(|r| !r.is_allowed()).count();
        assert_eq!(rejected, 1);
        assert!(!results[3].is_allowed(), "the N+1th is the rejected one");

        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..3 {
            assert!(rl.check_analysis(AnalysisKind::Text, "u1", "10.0.0.1").is_allowed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_counts_down_to_window_end() {
        let rl = RateLimiter::new(limits());
        assert!(rl.check_analysis(AnalysisKind::Transaction, "u1", "ip").is_allowed());
        tokio::time::advance(Duration::from_secs(15)).await;
        match rl.check_analysis(AnalysisKind::Transaction, "u1", "ip") {
            RateLimitResult::Limited {
                endpoint,
                retry_after,
            } => {
                assert_eq!(endpoint, Endpoint::Analysis(AnalysisKind::Transaction));
                assert_eq!(retry_after, Duration::from_secs(45));
            }
            other => panic!("expected limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn kinds_and_users_have_independent_windows() {
        let rl = RateLimiter::new(limits());
        assert!(rl.check_analysis(AnalysisKind::Transaction, "u1", "ip").is_allowed());
        assert!(!rl.check_analysis(AnalysisKind::Transaction, "u1", "ip").is_allowed());
        assert!(rl.check_analysis(AnalysisKind::Transaction, "u2", "ip").is_allowed());
        assert!(rl.check_analysis(AnalysisKind::Url, "u1", "ip").is_allowed());
    }

    #[tokio::test]
    async fn unresolved_addresses_do_not_share_one_window() {
        let mut l = limits();
        l.per_ip = 1;
        let rl = RateLimiter::new(l);
        assert!(rl.check_analysis(AnalysisKind::Text, "alice", UNKNOWN_IP).is_allowed());
        assert!(rl.check_analysis(AnalysisKind::Text, "bob", UNKNOWN_IP).is_allowed());
        assert!(!rl.check_analysis(AnalysisKind::Url, "alice", UNKNOWN_IP).is_allowed());
    }

    #[tokio::test]
    async fn per_ip_limit_spans_kinds_and_rejection_consumes_nothing() {
        let mut l = limits();
        l.per_ip = 2;
        let rl = RateLimiter::new(l);
        assert!(rl.check_analysis(AnalysisKind::Text, "a", "1.1.1.1").is_allowed());
        assert!(rl.check_analysis(AnalysisKind::Url, "b", "1.1.1.1").is_allowed());
        match rl.check_analysis(AnalysisKind::Vishing, "c", "1.1.1.1") {
            RateLimitResult::Limited { endpoint, .. } => assert_eq!(endpoint, Endpoint::AnyAnalysis),
            other => panic!("expected ip limit, got {other:?}"),
        }
        // The rejected request did not open a vishing window for "c".
        assert!(!rl
            .windows
            .lock()
            .contains_key(&("user:c".to_string(), Endpoint::Analysis(AnalysisKind::Vishing))));
    }

    #[tokio::test]
    async fn auth_endpoint_class_is_five_per_ip() {
        let rl = RateLimiter::new(limits());
        for _ in 0..5 {
            assert!(rl.check_auth("9.9.9.9").is_allowed());
        }
        assert!(!rl.check_auth("9.9.9.9").is_allowed());
        assert!(rl.check_auth("8.8.8.8").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_expired_windows() {
        let rl = RateLimiter::new(limits());
        rl.check_analysis(AnalysisKind::Text, "u1", "ip");
        assert_eq!(rl.tracked_windows(), 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        rl.prune();
        assert_eq!(rl.tracked_windows(), 0);
    }

    #[test]
    fn concurrent_burst_admits_exactly_the_limit() {
        let mut l = limits();
        l.text = 10;
        let rl = Arc::new(RateLimiter::new(l));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let rl = rl.clone();
                std::thread::spawn(move || rl.check_analysis(AnalysisKind::Text, "burst", "ip"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_allowed())
            .count();
        assert_eq!(admitted, 10);
    }
}
