pub mod credential_store;
pub mod http_client;
pub mod pipeline;
pub mod rate_limiter;
