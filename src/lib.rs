//! Portcullis - an API gateway for HTTP services.
//!
//! Portcullis sits in front of a set of upstream services and, for every inbound request,
//! picks a route by method and path prefix, checks the caller's API key, charges a
//! per-caller token bucket and streams the request to the route's upstream under a
//! deadline. Responses are relayed unchanged apart from hop-by-hop headers.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portcullis::{
//!     adapters::{HttpClientAdapter, HttpHandler, build_app},
//!     config::load_config,
//!     core::InMemoryRateLimiter,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = load_config("portcullis.yaml").await?;
//! let handler = HttpHandler::from_config(
//!     &cfg,
//!     Arc::new(HttpClientAdapter::new()?),
//!     Arc::new(InMemoryRateLimiter::new()),
//!     None,
//! )?;
//! let app = build_app(Arc::new(handler), cfg.server.read_timeout());
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! routing and rate limiting inside `core`. Every inbound request runs the same chain:
//! access log, body limit, route match, authentication, rate limit, then the proxy.
//!
//! # Error Handling
//! Startup paths return `eyre::Result<T>` with context attached through `WrapErr`. Request
//! paths map failures to [`core::GatewayError`], rendered as
//! `{"error":{"code":..,"message":..}}`.
//!
//! # Concurrency & Data Structures
//! Token buckets live in an `scc::HashMap`; each bucket carries its own mutex so callers
//! with different keys never contend.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler, build_app},
    core::{GatewayError, InMemoryRateLimiter},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
