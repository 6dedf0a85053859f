//! Per-request metadata threaded through the pipeline.
use std::{net::SocketAddr, sync::Arc};

use crate::core::router::Route;

/// Identity assigned to callers that were never authenticated.
pub const ANONYMOUS_IDENTITY: &str = "anon";

/// Metadata owned by exactly one in-flight request.
///
/// Created when the request enters the chain and passed by `&mut` to every
/// stage; earlier stages fill in fields that later stages (and the proxy
/// dispatcher) read. Dropped together with the request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Route resolved by the route-matching stage
    pub route: Option<Arc<Route>>,
    /// Caller identity resolved by the authentication stage
    pub identity: Option<String>,
    /// Correlation id, set by the access-log stage
    pub request_id: Option<String>,
    /// Peer address of the inbound connection, when known
    pub client_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(client_addr: Option<SocketAddr>) -> Self {
        Self {
            client_addr,
            ..Self::default()
        }
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route.as_deref().map(|route| route.id.as_str())
    }

    /// Resolved identity, or [`ANONYMOUS_IDENTITY`] when authentication did not run.
    pub fn identity_or_anonymous(&self) -> &str {
        match self.identity.as_deref() {
            Some(identity) if !identity.is_empty() => identity,
            _ => ANONYMOUS_IDENTITY,
        }
    }

    /// Rate-limit key: `route:identity`, or just the identity without a route.
    pub fn rate_limit_key(&self) -> String {
        let identity = self.identity_or_anonymous();
        match self.route_id() {
            Some(route_id) if !route_id.is_empty() => format!("{route_id}:{identity}"),
            _ => identity.to_string(),
        }
    }
}
