//! Configuration data structures for Portcullis.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and carry defaults so that minimal configs remain concise; rules that
//! cannot be expressed as serde defaults live in [`GatewayConfig::apply_defaults`].
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_CREDENTIAL_HEADER: &str = "X-API-Key";
pub const DEFAULT_MAX_BODY_BYTES: u64 = 10 << 20;
pub const DEFAULT_REQUESTS_PER_MINUTE: i64 = 60;
pub const DEFAULT_BURST: i64 = 30;
pub const DEFAULT_ROUTE_TIMEOUT_MS: i64 = 3000;

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_max_body_bytes() -> u64 {
    DEFAULT_MAX_BODY_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_prometheus_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}

fn default_credential_header() -> String {
    DEFAULT_CREDENTIAL_HEADER.to_string()
}

fn default_route_timeout_ms() -> i64 {
    DEFAULT_ROUTE_TIMEOUT_MS
}

/// Root configuration document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Ordered: earlier routes shadow later ones
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Create a new configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Replace blank or non-positive values with their documented defaults.
    pub fn apply_defaults(&mut self) {
        let listen_addr = self.server.listen_addr.trim();
        if listen_addr.is_empty() {
            self.server.listen_addr = default_listen_addr();
        } else if listen_addr.starts_with(':') {
            // ":8080" shorthand binds every interface
            self.server.listen_addr = format!("0.0.0.0{listen_addr}");
        }
        if self.observability.log_level.trim().is_empty() {
            self.observability.log_level = default_log_level();
        }
        if self.auth.header.trim().is_empty() {
            self.auth.header = default_credential_header();
        }
        if self.limits.default.requests_per_minute <= 0 {
            self.limits.default.requests_per_minute = DEFAULT_REQUESTS_PER_MINUTE;
        }
        if self.limits.default.burst <= 0 {
            self.limits.default.burst = DEFAULT_BURST;
        }
        for route in &mut self.routes {
            if route.upstream.timeout_ms <= 0 {
                route.upstream.timeout_ms = DEFAULT_ROUTE_TIMEOUT_MS;
            }
        }
    }
}

/// Listener and request-level limits.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Maximum time allowed between request body chunks
    pub read_timeout_ms: u64,
    /// Request body ceiling; 0 disables the limit
    pub max_body_bytes: u64,
    /// Time allowed for in-flight requests to finish on shutdown
    pub shutdown_timeout_ms: u64,
    /// Expose `/debug/match` and `/debug/router`
    pub debug_endpoints: bool,
}

impl ServerSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_timeout_ms: default_read_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            debug_endpoints: false,
        }
    }
}

/// Log output format.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive, e.g. "info" or "portcullis=debug"
    pub log_level: String,
    pub log_format: LogFormat,
    /// Install the Prometheus recorder and serve it at `prometheus_path`
    pub metrics_enabled: bool,
    pub prometheus_path: String,
    /// Access-log requests to operational endpoints too
    pub log_operational_endpoints: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_enabled: default_true(),
            prometheus_path: default_prometheus_path(),
            log_operational_endpoints: false,
        }
    }
}

/// One API key entry: the secret presented by callers and the identity it maps to.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ApiKeyConfig {
    pub id: String,
    pub secret: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// Header carrying the API key
    pub header: String,
    pub keys: Vec<ApiKeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_credential_header(),
            keys: Vec::new(),
        }
    }
}

/// `{requests_per_minute, burst}` as written in configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicyConfig {
    pub requests_per_minute: i64,
    pub burst: i64,
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst: DEFAULT_BURST,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LimitsConfig {
    /// Global fallback policy
    #[serde(default)]
    pub default: RateLimitPolicyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MatchConfig {
    pub path_prefix: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    /// Full round-trip deadline; non-positive means the 3 s default
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: i64,
}

/// A single route entry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub id: String,
    #[serde(rename = "match")]
    pub matcher: MatchConfig,
    pub upstream: UpstreamConfig,
    /// Route-wide policy replacing `limits.default`
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicyConfig>,
    /// Identity → policy, replacing both of the above for that identity
    #[serde(default)]
    pub rate_limit_overrides: HashMap<String, RateLimitPolicyConfig>,
}

impl RouteConfig {
    pub fn new(
        id: impl Into<String>,
        path_prefix: impl Into<String>,
        methods: &[&str],
        upstream_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            matcher: MatchConfig {
                path_prefix: path_prefix.into(),
                methods: methods.iter().map(|m| m.to_string()).collect(),
            },
            upstream: UpstreamConfig {
                url: upstream_url.into(),
                timeout_ms: DEFAULT_ROUTE_TIMEOUT_MS,
            },
            rate_limit: None,
            rate_limit_overrides: HashMap::new(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.upstream.timeout_ms = timeout_ms;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_minute: i64, burst: i64) -> Self {
        self.rate_limit = Some(RateLimitPolicyConfig {
            requests_per_minute,
            burst,
        });
        self
    }

    pub fn with_override(
        mut self,
        identity: impl Into<String>,
        requests_per_minute: i64,
        burst: i64,
    ) -> Self {
        self.rate_limit_overrides.insert(
            identity.into(),
            RateLimitPolicyConfig {
                requests_per_minute,
                burst,
            },
        );
        self
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen_addr = addr.into();
        self
    }

    /// Set the request body ceiling (0 disables it)
    pub fn max_body_bytes(mut self, bytes: u64) -> Self {
        self.config.server.max_body_bytes = bytes;
        self
    }

    /// Enable the `/debug/*` endpoints
    pub fn debug_endpoints(mut self, enabled: bool) -> Self {
        self.config.server.debug_endpoints = enabled;
        self
    }

    /// Set the header carrying API keys
    pub fn credential_header(mut self, header: impl Into<String>) -> Self {
        self.config.auth.header = header.into();
        self
    }

    /// Register an API key `secret` for identity `id`
    pub fn api_key(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.auth.keys.push(ApiKeyConfig {
            id: id.into(),
            secret: secret.into(),
            metadata: HashMap::new(),
        });
        self
    }

    /// Set the global default policy
    pub fn default_rate_limit(mut self, requests_per_minute: i64, burst: i64) -> Self {
        self.config.limits.default = RateLimitPolicyConfig {
            requests_per_minute,
            burst,
        };
        self
    }

    /// Enable or disable Prometheus export
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.observability.metrics_enabled = enabled;
        self
    }

    /// Append a route (order matters)
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.config.routes.push(route);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.config.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }
        let mut config = self.config;
        config.apply_defaults();
        Ok(config)
    }
}
