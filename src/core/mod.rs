pub mod context;
pub mod error;
pub mod rate_limiter;
pub mod router;

pub use context::RequestContext;
pub use error::GatewayError;
pub use rate_limiter::{Decision, InMemoryRateLimiter, Policy};
pub use router::{Route, Router};
