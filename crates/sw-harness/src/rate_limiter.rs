use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A request was refused because its key has no tokens left.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for key `{key}`, retry after {retry_after:?}")]
    Exceeded {
        key: String,
        retry_after: Duration,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub tokens_per_second: f64,
    /// Maximum burst size (bucket capacity).
    pub max_burst: f64,
}

impl RateLimitConfig {
    /// Allow one request per `interval`.
    pub fn per_interval(interval: Duration) -> Self {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        Self {
            tokens_per_second: 1.0 / secs,
            max_burst: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Bucket (per-key state)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.tokens_per_second).min(config.max_burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, config: &RateLimitConfig) -> Result<(), Duration> {
        self.refill(config);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / config.tokens_per_second))
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Token-bucket limiter with one bucket per key (typically a client id).
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for `key`.
    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.max_burst));

        bucket.try_consume(&self.config).map_err(|retry_after| {
            warn!(key, ?retry_after, "rate limit exceeded");
            RateLimitError::Exceeded {
                key: key.to_string(),
                retry_after,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn per_interval_allows_one_then_refills() {
        let limiter = RateLimiter::new(RateLimitConfig::per_interval(Duration::from_secs(10)));
        assert!(limiter.check("c1").is_ok());
        let err = limiter.check("c1").unwrap_err();
        let RateLimitError::Exceeded { key, retry_after } = err;
        assert_eq!(key, "c1");
        assert!(retry_after <= Duration::from_secs(11));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.check("c1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::per_interval(Duration::from_secs(10)));
        assert!(limiter.check("c1").is_ok());
        assert!(limiter.check("c2").is_ok());
        assert!(limiter.check("c1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_shrinks_while_waiting() {
        let limiter = RateLimiter::new(RateLimitConfig::per_interval(Duration::from_secs(10)));
        assert!(limiter.check("k").is_ok());
        tokio::time::advance(Duration::from_secs(4)).await;
        let RateLimitError::Exceeded { retry_after, .. } = limiter.check("k").unwrap_err();
        assert!(retry_after > Duration::from_millis(5_900));
        assert!(retry_after < Duration::from_millis(6_100));
    }
}
