// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Default [`RateLimiter`] implementation: a classic token bucket,
//! counting tokens per lookup batch rather than per byte.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::traits::RateLimiter;
use crate::types::Cancelled;

/// Tokens refill at a fixed rate up to a maximum burst capacity. Each
/// batch consumes exactly one token.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32, capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = elapsed.as_secs_f64() * self.rate_per_sec;
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_consume_one(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_one(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let needed = 1.0 - self.tokens;
        Duration::from_secs_f64(needed / self.rate_per_sec)
    }
}

/// A [`RateLimiter`] backed by a single shared [`TokenBucket`].
pub struct TokenBucketLimiter {
    bucket: Mutex<TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate_per_sec, burst)),
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume_one() {
                    return Ok(());
                }
                bucket.time_until_one()
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("rate limiter acquire cancelled while waiting {:?}", wait);
                    return Err(Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_consumes_burst_then_waits() {
        let limiter = TokenBucketLimiter::new(1, 1);
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let wait = tokio::time::timeout(Duration::from_millis(10), limiter.acquire(&cancel)).await;
        assert!(wait.is_err(), "second acquire should block on empty bucket");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_is_cancellable() {
        let limiter = TokenBucketLimiter::new(1, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let result = limiter.acquire(&cancel).await;
        assert!(result.is_err());
    }
}
