//! In‑memory token‑bucket rate limiting keyed by arbitrary strings.
//!
//! Each key owns one bucket, created lazily at full capacity the first time
//! the key is seen. Refill is continuous and evaluated lazily on every call
//! (no background ticker): `tokens += elapsed * rpm / 60`, capped at `burst`.
//!
//! Buckets live in an `scc::HashMap` so insertion of new keys never takes a
//! global lock; the refill-and-decide step is serialised by a mutex owned by
//! the bucket itself, so calls for different keys never contend.
//!
//! Buckets are never evicted: memory grows with the number of distinct keys
//! ever observed.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use scc::HashMap;

use crate::{
    config::models::RateLimitPolicyConfig,
    ports::rate_limiter::{RateLimitError, RateLimiter},
};

/// Informational limit reported when no meaningful policy is configured.
pub const DEGENERATE_POLICY_LIMIT: i64 = 60;

/// Requests-per-minute refill rate plus bucket capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub requests_per_minute: i64,
    pub burst: i64,
}

impl Policy {
    pub const fn new(requests_per_minute: i64, burst: i64) -> Self {
        Self {
            requests_per_minute,
            burst,
        }
    }

    /// Both rate and burst are positive.
    pub fn is_enforceable(&self) -> bool {
        self.requests_per_minute > 0 && self.burst > 0
    }

    fn refill_per_second(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }
}

impl From<&RateLimitPolicyConfig> for Policy {
    fn from(config: &RateLimitPolicyConfig) -> Self {
        Policy::new(config.requests_per_minute, config.burst)
    }
}

/// Outcome of one `allow` call. Never mutated after it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: i64,
    /// Whole tokens left after this decision, never negative
    pub remaining: i64,
    /// Unix seconds at which the bucket would be full again without traffic
    pub reset_at: i64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Concurrent token-bucket store.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    buckets: HashMap<String, Arc<Mutex<Bucket>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys that currently own a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    async fn bucket_for(
        &self,
        key: &str,
        capacity: f64,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<Bucket>> {
        // entry_async holds the slot lock while inserting, so concurrent first
        // calls for one key observe the same bucket.
        self.buckets
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: capacity,
                    last_refill: now,
                }))
            })
            .get()
            .clone()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(
        &self,
        key: &str,
        policy: Policy,
        now: DateTime<Utc>,
    ) -> Result<Decision, RateLimitError> {
        if !policy.is_enforceable() {
            return Ok(Decision {
                allowed: true,
                limit: DEGENERATE_POLICY_LIMIT,
                remaining: DEGENERATE_POLICY_LIMIT,
                reset_at: 0,
            });
        }

        let refill_per_second = policy.refill_per_second();
        let capacity = policy.burst as f64;

        let bucket = self.bucket_for(key, capacity, now).await;
        let mut bucket = bucket.lock().map_err(|_| RateLimitError::Poisoned {
            key: key.to_string(),
        })?;

        let elapsed = (now - bucket.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let reset_at = if bucket.tokens >= capacity {
            now.timestamp()
        } else {
            let seconds_to_full = (capacity - bucket.tokens) / refill_per_second;
            (now + TimeDelta::nanoseconds((seconds_to_full * 1e9) as i64)).timestamp()
        };

        Ok(Decision {
            allowed,
            limit: policy.requests_per_minute,
            remaining: (bucket.tokens as i64).max(0),
            reset_at,
        })
    }
}
