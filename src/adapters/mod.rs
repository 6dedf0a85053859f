pub mod credential_store;
pub mod http_client;
pub mod http_handler;
pub mod middleware;
pub mod proxy;

/// Re-export commonly used types from adapters
pub use credential_store::StaticCredentialStore;
pub use http_client::{HttpClientAdapter, UpstreamPoolSettings};
pub use http_handler::{HttpHandler, OperationalEndpoints, build_app};
pub use middleware::*;
pub use proxy::ProxyDispatcher;
