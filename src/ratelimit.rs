//! # Rate Limiter
//!
//! Token buckets per `(route class, client IP)` with burst equal to the
//! per-minute limit. Buckets idle for a while are evicted by a periodic
//! sweep so the map stays bounded.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::constants::{
    RATE_LIMIT_API_PER_MIN, RATE_LIMIT_AUTH_PER_MIN, RATE_LIMIT_SWEEP_INTERVAL_SECS,
    RATE_LIMIT_UPLOAD_PER_MIN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Auth,
    Api,
    Upload,
}

impl RouteClass {
    pub fn limit_per_minute(&self) -> u32 {
        match self {
            Self::Auth => RATE_LIMIT_AUTH_PER_MIN,
            Self::Api => RATE_LIMIT_API_PER_MIN,
            Self::Upload => RATE_LIMIT_UPLOAD_PER_MIN,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Mutex-guarded bucket map; one instance per process.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(RouteClass, IpAddr), Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token, or report how long until one is available.
    pub fn check(&self, class: RouteClass, ip: IpAddr) -> Result<(), u64> {
        let limit = class.limit_per_minute() as f64;
        let rate_per_sec = limit / 60.0;
        let now = Instant::now();

        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry((class, ip)).or_insert(Bucket {
            tokens: limit,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(limit);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after = ((1.0 - bucket.tokens) / rate_per_sec).ceil() as u64;
            Err(retry_after.max(1))
        }
    }

    /// Evict buckets idle for more than five minutes.
    pub fn sweep(&self) {
        let cutoff = Duration::from_secs(300);
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        buckets.retain(|_, bucket| now.duration_since(bucket.last_seen) < cutoff);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Background sweep loop, stopped by the supervisor.
pub async fn run_sweeper(limiter: std::sync::Arc<RateLimiter>, cancel: CancellationToken) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(RATE_LIMIT_SWEEP_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.sweep(),
            _ = cancel.cancelled() => {
                tracing::info!("rate limiter sweeper stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_burst_then_limited() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_AUTH_PER_MIN {
            assert!(limiter.check(RouteClass::Auth, ip(1)).is_ok());
        }
        let retry = limiter.check(RouteClass::Auth, ip(1)).unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn test_buckets_are_per_ip_and_class() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_AUTH_PER_MIN {
            limiter.check(RouteClass::Auth, ip(1)).unwrap();
        }
        assert!(limiter.check(RouteClass::Auth, ip(1)).is_err());
        // A different IP and a different class are unaffected.
        assert!(limiter.check(RouteClass::Auth, ip(2)).is_ok());
        assert!(limiter.check(RouteClass::Api, ip(1)).is_ok());
    }

    #[test]
    fn test_sweep_keeps_recent_buckets() {
        let limiter = RateLimiter::new();
        limiter.check(RouteClass::Api, ip(1)).unwrap();
        limiter.check(RouteClass::Api, ip(2)).unwrap();
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 2);
    }
}
