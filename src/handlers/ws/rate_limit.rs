//! Per-connection token bucket.

use std::time::Instant;

/// Token bucket limiting messages per second on one connection.
///
/// The bucket starts full with one second's budget; refill is continuous.
/// Exhaustion is a policy violation and the connection is closed.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f32,
    tokens: f32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32) -> Self {
        Self {
            rate_per_sec: rate_per_sec as f32,
            tokens: rate_per_sec as f32,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f32();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
            self.last_refill = now;
        }
    }

    /// Consume one message token. False means the budget is exhausted.
    pub fn check_message(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> f32 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_burst_up_to_rate() {
        let mut limiter = RateLimiter::new(10);
        for _ in 0..10 {
            assert!(limiter.check_message());
        }
        assert!(!limiter.check_message());
    }

    #[test]
    fn test_refills_over_time() {
        let mut limiter = RateLimiter::new(1000);
        for _ in 0..1000 {
            assert!(limiter.check_message());
        }
        assert!(!limiter.check_message());

        std::thread::sleep(std::time::Duration::from_millis(50));
        // ~50 tokens refilled
        assert!(limiter.check_message());
    }

    #[test]
    fn test_tokens_cap_at_rate() {
        let mut limiter = RateLimiter::new(5);
        std::thread::sleep(std::time::Duration::from_millis(50));
        limiter.refill();
        assert!(limiter.remaining() <= 5.0);
    }
}
