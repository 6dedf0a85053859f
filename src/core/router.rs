//! Ordered, first‑match‑wins route table.
//!
//! Routes are evaluated in the order they were added; the first route whose
//! method set contains the request method and whose prefix covers the request
//! path wins, even when a later route has a longer (more specific) prefix.
//! The table is built once at startup and only read afterwards, so lookups
//! need no synchronisation.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use eyre::{Result, WrapErr};
use url::Url;

use crate::{config::models::RouteConfig, core::rate_limiter::Policy};

/// Upstream deadline applied when a route does not configure a positive one.
pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_millis(3000);

/// A configured mapping from (methods, path prefix) to an upstream target.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub id: String,
    /// Uppercase method names accepted by this route
    pub methods: HashSet<String>,
    /// Normalized prefix: no trailing slash except the root `/`
    pub prefix: String,
    pub upstream: Url,
    pub timeout: Duration,
    /// Route-wide policy replacing the global default
    pub rate_limit: Option<Policy>,
    /// Per-identity policies, taking precedence over `rate_limit`
    pub rate_limit_overrides: HashMap<String, Policy>,
}

impl Route {
    pub fn new<I, M>(id: impl Into<String>, methods: I, prefix: &str, upstream: Url) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<str>,
    {
        Self {
            id: id.into(),
            methods: methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .collect(),
            prefix: normalize_prefix(prefix),
            upstream,
            timeout: DEFAULT_ROUTE_TIMEOUT,
            rate_limit: None,
            rate_limit_overrides: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, policy: Policy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn with_override(mut self, identity: impl Into<String>, policy: Policy) -> Self {
        self.rate_limit_overrides.insert(identity.into(), policy);
        self
    }

    /// Build a route from its configuration entry.
    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        let upstream = Url::parse(config.upstream.url.trim()).wrap_err_with(|| {
            format!(
                "invalid upstream URL '{}' for route {}",
                config.upstream.url, config.id
            )
        })?;

        let timeout = if config.upstream.timeout_ms > 0 {
            Duration::from_millis(config.upstream.timeout_ms as u64)
        } else {
            DEFAULT_ROUTE_TIMEOUT
        };

        let mut route = Route::new(
            config.id.clone(),
            &config.matcher.methods,
            &config.matcher.path_prefix,
            upstream,
        )
        .with_timeout(timeout);

        route.rate_limit = config.rate_limit.as_ref().map(Policy::from);
        route.rate_limit_overrides = config
            .rate_limit_overrides
            .iter()
            .map(|(identity, policy)| (identity.clone(), Policy::from(policy)))
            .collect();

        Ok(route)
    }

    /// Whether this route accepts `method` (already uppercase) on `path`.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if !self.methods.contains(method) {
            return false;
        }
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// `scheme://host[:port]` of the upstream, without path.
    pub fn upstream_origin(&self) -> String {
        self.upstream.origin().ascii_serialization()
    }
}

/// Trim whitespace and any trailing slashes; an empty result becomes `/`.
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Insertion-ordered route table.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from configuration, preserving the configured order.
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self> {
        let mut router = Router::new();
        for config in routes {
            let route = Route::from_config(config)?;
            tracing::info!(
                route.id = %route.id,
                route.prefix = %route.prefix,
                route.upstream = %route.upstream_origin(),
                timeout_ms = route.timeout.as_millis() as u64,
                "Registered route"
            );
            router.add(route);
        }
        Ok(router)
    }

    /// Append a route. No uniqueness check: earlier routes shadow later ones.
    pub fn add(&mut self, route: Route) {
        self.routes.push(Arc::new(route));
    }

    /// First route (in insertion order) accepting `method` on `path`.
    pub fn find_matching_route(&self, method: &str, path: &str) -> Option<Arc<Route>> {
        let method = method.to_ascii_uppercase();
        self.routes
            .iter()
            .find(|route| route.matches(&method, path))
            .cloned()
    }

    /// Read-only view of the table for diagnostics.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
