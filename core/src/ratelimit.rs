//! Fixed-window rate limiting keyed by client.
//!
//! Each client key gets a window that opens on its first request and lasts
//! `window`. Up to `max` requests pass inside it; the rest are refused
//! until the window expires, at which point the count resets wholesale.
//! A client can therefore burst up to `2 * max` across a window boundary.

use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{DEFAULT_RATE_LIMIT_MAX, DEFAULT_RATE_LIMIT_WINDOW};

/// A request that passed, with what is left of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit of {limit} requests exceeded, retry in {}s", .retry_after.as_secs())]
pub struct RateLimited {
    pub limit: u32,
    pub retry_after: Duration,
}

impl RateLimited {
    /// `Retry-After` value in whole seconds, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs_f64().ceil().max(1.0) as u64
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max: u32,
    clients: DashMap<String, Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_WINDOW, DEFAULT_RATE_LIMIT_MAX)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            clients: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request for `key`.
    pub fn check(&self, key: &str) -> Result<RateDecision, RateLimited> {
        let now = Instant::now();
        let mut entry = self
            .clients
            .entry(key.to_string())
            .or_insert_with(|| Window { started: now, count: 0 });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        let reset_after = self.window.saturating_sub(now.duration_since(entry.started));
        if entry.count >= self.max {
            tracing::debug!(client = key, "rate limit exceeded");
            return Err(RateLimited {
                limit: self.max,
                retry_after: reset_after,
            });
        }

        entry.count += 1;
        Ok(RateDecision {
            limit: self.max,
            remaining: self.max - entry.count,
            reset_after,
        })
    }

    /// Drop windows that have expired. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.clients.len();
        self.clients
            .retain(|_, w| now.duration_since(w.started) < self.window);
        before.saturating_sub(self.clients.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn thirty_first_request_is_refused() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 30);

        let results: Vec<_> = (0..31).map(|_| limiter.check("10.0.0.1")).collect();
        let refused = results.iter().filter(|r| r.is_err()).count();

        assert_eq!(refused, 1);
        assert!(results[30].is_err());
        assert_eq!(results[29].unwrap().remaining, 0);
        assert_eq!(results[0].unwrap().remaining, 29);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 30);
        for _ in 0..30 {
            limiter.check("c").unwrap();
        }
        let refused = limiter.check("c").unwrap_err();
        assert_eq!(refused.retry_after, Duration::from_secs(60));
        assert_eq!(refused.retry_after_secs(), 60);

        tokio::time::advance(Duration::from_secs(61)).await;
        let decision = limiter.check("c").unwrap();
        assert_eq!(decision.remaining, 29);
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_windows() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 5);
        limiter.check("old").unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        limiter.check("fresh").unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn retry_after_rounds_up() {
        let limited = RateLimited {
            limit: 1,
            retry_after: Duration::from_millis(200),
        };
        assert_eq!(limited.retry_after_secs(), 1);
    }
}
