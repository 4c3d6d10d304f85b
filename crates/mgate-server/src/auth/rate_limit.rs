//! Sliding-window rate limiter for login attempts.
//!
//! Per-key attempt timestamps that decay over a rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// key → attempt timestamps within the window.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the key, and record it if so.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;

        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| *t > cutoff);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        let cutoff = Instant::now() - self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| *t > cutoff);
            !attempts.is_empty()
        });
    }
}

/// Pre-configured limiters for the gateway.
#[derive(Debug)]
pub struct GatewayRateLimits {
    /// Login attempts: max 5 per minute per IP address.
    pub login: RateLimiter,
}

impl Default for GatewayRateLimits {
    fn default() -> Self {
        Self {
            login: RateLimiter::new(5, 60),
        }
    }
}

impl GatewayRateLimits {
    pub fn check_login(&mut self, ip: &IpAddr) -> bool {
        self.login.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.login.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_after_max_attempts() {
        let mut limiter = RateLimiter::new(3, 60);
        assert!(limiter.check_and_record("1.2.3.4"));
        assert!(limiter.check_and_record("1.2.3.4"));
        assert!(limiter.check_and_record("1.2.3.4"));
        assert!(!limiter.check_and_record("1.2.3.4"));
        // Other keys are unaffected.
        assert!(limiter.check_and_record("5.6.7.8"));
    }

    #[test]
    fn gc_drops_empty_keys() {
        let mut limiter = RateLimiter::new(3, 0);
        limiter.check_and_record("1.2.3.4");
        limiter.gc();
        assert!(limiter.entries.is_empty());
    }
}
