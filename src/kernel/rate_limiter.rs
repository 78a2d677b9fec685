//! Rate limiting and throttling.
//!
//! Token-bucket admission control keyed by arbitrary strings
//! (`"llm:<identity>"`, `"api:<id>"`, ...). Each key gets its own bucket the
//! first time it is seen; buckets live for the lifetime of the limiter.
//!
//! Locking is two-level: the key map is behind an `RwLock` that is only
//! write-locked when a new key appears, and every bucket has its own `Mutex`
//! for the check-and-consume step. Callers on unrelated keys never contend on
//! the same bucket lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::Result;
use crate::validation::validate_positive;

/// Bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens a bucket holds (burst size).
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_second: 0.2,
        }
    }
}

impl RateLimitConfig {
    pub fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_positive(self.capacity, "rate_limit.capacity")?;
        validate_positive(self.refill_per_second, "rate_limit.refill_per_second")
    }
}

/// A single token bucket.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            tokens: config.capacity,
            refill_rate: config.refill_per_second,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn retry_after(&mut self, cost: f64, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= cost {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((cost - self.tokens) / self.refill_rate)
    }
}

/// Rate limiter - per-key token buckets.
///
/// Shared across the pipeline and plugins behind an `Arc`; all methods take
/// `&self`.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    key_configs: RwLock<HashMap<String, RateLimitConfig>>,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(default_config: Option<RateLimitConfig>) -> Self {
        Self {
            default_config: default_config.unwrap_or_default(),
            key_configs: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Use `config` for `key` instead of the default. Only affects a bucket
    /// that has not been created yet.
    pub fn configure(&self, key: impl Into<String>, config: RateLimitConfig) {
        self.key_configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), config);
    }

    /// Consume one token from `key`'s bucket if available.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_cost(key, 1.0)
    }

    /// Consume `cost` tokens from `key`'s bucket if available.
    pub fn allow_cost(&self, key: &str, cost: f64) -> bool {
        self.allow_at(key, cost, Instant::now())
    }

    /// Seconds until `cost` tokens would be available for `key`; zero if a
    /// call would be allowed right now. Does not consume.
    pub fn retry_after(&self, key: &str, cost: f64) -> Duration {
        self.retry_after_at(key, cost, Instant::now())
    }

    /// Current token count for `key`, if its bucket exists.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let bucket = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(Instant::now());
        Some(bucket.tokens)
    }

    /// Number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn allow_at(&self, key: &str, cost: f64, now: Instant) -> bool {
        let bucket = self.bucket(key, now);
        let allowed = bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_consume(cost, now);
        if !allowed {
            tracing::debug!("rate_limited: key={}, cost={}", key, cost);
        }
        allowed
    }

    pub(crate) fn retry_after_at(&self, key: &str, cost: f64, now: Instant) -> Duration {
        self.bucket(key, now)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retry_after(cost, now)
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return bucket.clone();
        }

        let config = self
            .key_configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(self.default_config);

        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(config, now))))
            .clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(None)
    }
}
