//! Per-identity admission control with a fixed window.
//!
//! A window starts on the first hit for an identity (or the first hit after the previous
//! window expired) and admits up to `capacity` requests. Bursts of up to 2x capacity are
//! possible across a window edge; this dampens abuse, it is not a quota.

use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub allowed: bool,
    /// Whole seconds until the window resets (rounded up, at least 1). Only set when denied.
    pub retry_after_seconds: Option<u64>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: None,
        }
    }

    fn denied(remaining: Duration) -> Self {
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        Self {
            allowed: false,
            retry_after_seconds: Some(secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

/// Fixed-window limiter keyed by identity.
///
/// Each check is a single read-modify-write under the map's entry lock, so concurrent checks
/// for the same identity cannot both observe a stale count.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    capacity: u32,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(window: Duration, capacity: u32) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            windows: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn admit(&self, identity: &str) -> Admission {
        self.admit_at(identity, Instant::now())
    }

    pub fn admit_at(&self, identity: &str, now: Instant) -> Admission {
        let mut entry = self
            .windows
            .entry(identity.to_string())
            .or_insert(RateWindow {
                started_at: now,
                count: 0,
            });
        let w = entry.value_mut();
        let elapsed = now.saturating_duration_since(w.started_at);

        if w.count == 0 || elapsed >= self.window {
            w.started_at = now;
            w.count = 1;
            return Admission::allowed();
        }
        if w.count < self.capacity {
            w.count += 1;
            return Admission::allowed();
        }
        Admission::denied(self.window - elapsed)
    }

    /// Drop windows that have expired. Purely a memory bound; expired windows are reset
    /// lazily on the next hit anyway.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started_at) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn denies_the_request_past_capacity_with_retry_after() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 100);
        let t0 = Instant::now();
        for i in 0..100 {
            let a = limiter.admit_at("parent-a", t0 + Duration::from_millis(i));
            assert!(a.allowed, "request {} should be admitted", i + 1);
        }
        let denied = limiter.admit_at("parent-a", t0 + Duration::from_secs(10));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, Some(50));
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        assert!(limiter.admit_at("p", t0).allowed);
        assert!(limiter.admit_at("p", t0).allowed);
        assert!(!limiter.admit_at("p", t0 + Duration::from_secs(59)).allowed);
        assert!(limiter.admit_at("p", t0 + Duration::from_secs(60)).allowed);
    }

    #[test]
    fn retry_after_rounds_up_and_is_positive() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        limiter.admit_at("p", t0);
        let a = limiter.admit_at("p", t0 + Duration::from_millis(59_900));
        assert_eq!(a.retry_after_seconds, Some(1));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        assert!(limiter.admit_at("a", t0).allowed);
        assert!(limiter.admit_at("b", t0).allowed);
        assert!(!limiter.admit_at("a", t0).allowed);
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn purge_drops_only_expired_windows() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5);
        let t0 = Instant::now();
        limiter.admit_at("old", t0);
        limiter.admit_at("fresh", t0 + Duration::from_secs(50));
        assert_eq!(limiter.purge_expired(t0 + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked_identities(), 1);
    }

    #[test]
    fn concurrent_checks_never_exceed_capacity() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let l = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| l.admit("same-user").allowed).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
