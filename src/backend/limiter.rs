//! Per-backend QPS limiting.
//!
//! A token bucket with fixed-point atomic state: tokens are stored as
//! millitokens so fractional refill amounts survive integer atomics. The
//! long-term rate is `rate` tokens per second with bursts up to `burst`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Token-bucket limiter for backend query rates.
#[derive(Debug)]
pub struct QpsLimiter {
    /// Refill rate, tokens per second.
    rate: u32,

    /// Burst capacity, tokens.
    burst: u32,

    /// Current tokens, stored as tokens * 1000 for atomic fractional math.
    tokens_millis: AtomicU64,

    /// Last refill timestamp, nanoseconds since creation.
    last_refill_nanos: AtomicU64,

    /// Creation instant for time calculations.
    created_at: Instant,
}

impl QpsLimiter {
    /// Create a limiter that admits `rate` queries per second with bursts
    /// up to `burst`.
    #[must_use]
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate,
            burst,
            tokens_millis: AtomicU64::new(u64::from(burst) * 1000),
            last_refill_nanos: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    /// Get the configured rate.
    #[must_use]
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Admit one query, consuming a token if one is available.
    pub fn check(&self) -> bool {
        self.refill();
        self.tokens_millis
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                tokens.checked_sub(1000)
            })
            .is_ok()
    }

    /// Report whether a query would currently be admitted, without
    /// consuming a token. Selection policies peek; the send path consumes.
    pub fn check_only(&self) -> bool {
        self.refill();
        self.tokens_millis.load(Ordering::Relaxed) >= 1000
    }

    fn refill(&self) {
        let now = self.created_at.elapsed().as_nanos() as u64;
        let last = self.last_refill_nanos.swap(now, Ordering::Relaxed);
        let elapsed = now.saturating_sub(last);
        if elapsed == 0 {
            return;
        }

        let gained =
            (u128::from(elapsed) * u128::from(self.rate) / 1_000_000).min(u128::from(u64::MAX));
        let cap = u64::from(self.burst) * 1000;
        let _ = self
            .tokens_millis
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tokens| {
                Some(tokens.saturating_add(gained as u64).min(cap))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_empty() {
        let limiter = QpsLimiter::new(10, 3);

        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn test_check_only_does_not_consume() {
        let limiter = QpsLimiter::new(10, 1);

        assert!(limiter.check_only());
        assert!(limiter.check_only());
        assert!(limiter.check());
        assert!(!limiter.check_only());
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = QpsLimiter::new(1000, 1);
        assert!(limiter.check());
        assert!(!limiter.check());

        // At 1000 tokens/sec, 10ms is ample for one token.
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.check());
    }

    #[test]
    fn test_rate_accessor() {
        assert_eq!(QpsLimiter::new(500, 500).rate(), 500);
    }
}
