//! Outbound request pacing.
//!
//! Every helpdesk request first awaits [`RateLimiter::acquire`]. The default
//! limiter is a token bucket shared by list pagination, activity probes and
//! thread detail batches, so concurrent work cannot exceed the upstream quota.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait until one request may be sent.
    async fn acquire(&self);
}

/// Limiter that never waits. Used in tests and for local sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn acquire(&self) {}
}

/// Token bucket state
#[derive(Debug, Clone)]
struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Last time tokens were refilled
    last_refill: Instant,
    /// Tokens added per second
    rate: f64,
    /// Burst size
    max_tokens: f64,
}

impl TokenBucket {
    fn new(rate: u32, burst: u32) -> Self {
        let burst = burst.max(1);
        TokenBucket {
            tokens: burst as f64,
            last_refill: Instant::now(),
            rate: rate.max(1) as f64,
            max_tokens: burst as f64,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.rate))
        }
    }
}

/// Token bucket limiter: `rate` requests per second with bursts up to `burst`.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    bucket: Mutex<TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate, burst)),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self) {
        loop {
            let wait = match self.bucket.lock().try_consume(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            log::trace!("rate limiter: waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
