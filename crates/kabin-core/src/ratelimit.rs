//! Sliding-window rate limiter.
//!
//! Counters are keyed by arbitrary strings; the QR path runs three keys per
//! request (per IP, per locker, per device). Windows purge lazily on each
//! check. Denials carry the `Retry-After` value computed from the oldest
//! entry still inside the window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::RateLimited;

/// A limit rule: at most `limit` hits per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: usize,
    pub window_secs: i64,
}

/// QR requests per source IP.
pub const QR_IP: RateLimit = RateLimit { limit: 30, window_secs: 60 };
/// QR requests per target locker.
pub const QR_LOCKER: RateLimit = RateLimit { limit: 6, window_secs: 60 };
/// QR requests per device cookie.
pub const QR_DEVICE: RateLimit = RateLimit { limit: 1, window_secs: 20 };
/// Master-PIN attempts per kiosk.
pub const MASTER_PIN: RateLimit = RateLimit { limit: 5, window_secs: 300 };

#[must_use]
pub fn qr_ip_key(ip: &str) -> String {
    format!("qr_ip:{ip}")
}

#[must_use]
pub fn qr_locker_key(locker_id: i64) -> String {
    format!("qr_locker:{locker_id}")
}

#[must_use]
pub fn qr_device_key(device_id: &str) -> String {
    format!("qr_device:{device_id}")
}

#[must_use]
pub fn master_pin_key(kiosk_id: &str) -> String {
    format!("master_pin:{kiosk_id}")
}

/// In-process sliding-window limiter. One mutex guards all buckets — the
/// QR path is low-volume and the critical section is a few comparisons.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit against `key`, or reject it if the window is full.
    pub fn check(&self, key: &str, rule: RateLimit) -> Result<(), RateLimited> {
        self.check_at(key, rule, Utc::now())
    }

    /// Deterministic variant for tests and replay.
    pub fn check_at(
        &self,
        key: &str,
        rule: RateLimit,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimited> {
        let window = Duration::seconds(rule.window_secs);
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let mut windows = self.windows.lock().unwrap();
        let bucket = windows.entry(key.to_owned()).or_default();

        while bucket.front().is_some_and(|&hit| now - hit >= window) {
            bucket.pop_front();
        }

        if bucket.len() >= rule.limit {
            let oldest = bucket.front().copied().unwrap_or(now);
            let remaining = (oldest + window - now).num_seconds().max(1);
            return Err(RateLimited {
                retry_after_secs: remaining as u64,
            });
        }

        bucket.push_back(now);
        Ok(())
    }

    /// Drop buckets with no entries inside any plausible window. Called
    /// periodically so abandoned keys do not accumulate.
    pub fn purge(&self, older_than: DateTime<Utc>) {
        #[allow(clippy::unwrap_used)]
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, bucket| bucket.back().is_some_and(|&hit| hit >= older_than));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn thirtieth_request_passes_thirty_first_fails() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for _ in 0..30 {
            limiter.check_at("qr_ip:10.0.0.9", QR_IP, now).unwrap();
        }
        let err = limiter.check_at("qr_ip:10.0.0.9", QR_IP, now).unwrap_err();
        assert!(err.retry_after_secs >= 1);
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        limiter.check_at("qr_device:d1", QR_DEVICE, now).unwrap();
        // Still inside the 20 s device window.
        assert!(limiter
            .check_at("qr_device:d1", QR_DEVICE, now + Duration::seconds(19))
            .is_err());
        // The first hit has aged out.
        limiter
            .check_at("qr_device:d1", QR_DEVICE, now + Duration::seconds(20))
            .unwrap();
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        limiter.check_at("qr_device:d1", QR_DEVICE, now).unwrap();
        limiter.check_at("qr_device:d2", QR_DEVICE, now).unwrap();
    }

    #[test]
    fn retry_after_counts_down_from_oldest_entry() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        limiter.check_at("k", QR_DEVICE, now).unwrap();
        let err = limiter
            .check_at("k", QR_DEVICE, now + Duration::seconds(15))
            .unwrap_err();
        assert_eq!(err.retry_after_secs, 5);
    }

    #[test]
    fn purge_drops_stale_buckets() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        limiter.check_at("stale", QR_IP, now - Duration::seconds(600)).unwrap();
        limiter.check_at("fresh", QR_IP, now).unwrap();
        limiter.purge(now - Duration::seconds(300));

        let windows = limiter.windows.lock().unwrap();
        assert!(!windows.contains_key("stale"));
        assert!(windows.contains_key("fresh"));
    }
}
