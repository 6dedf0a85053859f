use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::rate_limiter::{Decision, Policy};

/// Internal limiter failures. A denied request is not an error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimitError {
    /// A previous holder of the bucket lock panicked
    #[error("bucket lock poisoned for key '{key}'")]
    Poisoned { key: String },
}

/// RateLimiter defines the port for quota decisions keyed by an opaque string
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Charge one request against `key` under `policy` at instant `now`
    ///
    /// # Returns
    /// The decision (allowed or denied, with remaining budget), or an error
    /// only when the limiter itself failed
    async fn allow(
        &self,
        key: &str,
        policy: Policy,
        now: DateTime<Utc>,
    ) -> Result<Decision, RateLimitError>;
}
