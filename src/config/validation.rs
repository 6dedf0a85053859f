use std::{collections::HashMap, net::SocketAddr};

use axum::http::{HeaderName, Method};
use eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::models::{GatewayConfig, RateLimitPolicyConfig, RouteConfig};

static ROUTE_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("invalid route id regex"));

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        // Validate listen address
        if let Err(e) = Self::validate_listen_address(&config.server.listen_addr) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_credential_header(&config.auth.header) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_policy("limits.default", &config.limits.default) {
            errors.push(e);
        }

        if config.observability.metrics_enabled
            && !config.observability.prometheus_path.starts_with('/')
        {
            errors.push(ValidationError::InvalidField {
                field: "observability.prometheus_path".to_string(),
                message: "Must start with '/'".to_string(),
            });
        }

        // Validate routes
        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        } else {
            for (index, route) in config.routes.iter().enumerate() {
                if let Err(mut route_errors) = Self::validate_single_route(index, route) {
                    errors.append(&mut route_errors);
                }
            }
        }

        if let Err(conflict_error_list) = Self::check_route_conflicts(&config.routes) {
            errors.extend(conflict_error_list);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_credential_header(header: &str) -> ValidationResult<()> {
        if HeaderName::from_bytes(header.trim().as_bytes()).is_err() {
            return Err(ValidationError::InvalidField {
                field: "auth.header".to_string(),
                message: format!("'{header}' is not a valid HTTP header name"),
            });
        }
        Ok(())
    }

    /// Validate a single route entry
    fn validate_single_route(index: usize, config: &RouteConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let label = if config.id.is_empty() {
            format!("routes[{index}]")
        } else {
            format!("route '{}'", config.id)
        };

        if config.id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("routes[{index}].id"),
            });
        } else if !ROUTE_ID_REGEX.is_match(&config.id) {
            errors.push(ValidationError::InvalidField {
                field: format!("{label} id"),
                message: "Route ids may contain letters, digits, '.', '_' and '-'".to_string(),
            });
        }

        if !config.matcher.path_prefix.trim().starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("{label} match.path_prefix"),
                message: "Path prefixes must start with '/'".to_string(),
            });
        }

        if config.matcher.methods.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("{label} match.methods"),
                message: "At least one method is required".to_string(),
            });
        }
        for method in &config.matcher.methods {
            if Method::from_bytes(method.trim().as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{label} match.methods"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        if let Err(e) = Self::validate_url(&config.upstream.url, &format!("{label} upstream.url")) {
            errors.push(e);
        }

        if let Some(policy) = &config.rate_limit {
            if let Err(e) = Self::validate_policy(&format!("{label} rate_limit"), policy) {
                errors.push(e);
            }
        }

        for (identity, policy) in &config.rate_limit_overrides {
            if identity.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{label} rate_limit_overrides"),
                    message: "Override identities cannot be empty".to_string(),
                });
            }
            let field = format!("{label} rate_limit_overrides.{identity}");
            if let Err(e) = Self::validate_policy(&field, policy) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str.trim()) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Negative values are rejected; zero is accepted and means "not enforced".
    fn validate_policy(field: &str, policy: &RateLimitPolicyConfig) -> ValidationResult<()> {
        if policy.requests_per_minute < 0 || policy.burst < 0 {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "requests_per_minute and burst cannot be negative".to_string(),
            });
        }
        Ok(())
    }

    /// Duplicate route ids are reported; shadowed prefixes are legal and only logged.
    fn check_route_conflicts(routes: &[RouteConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for (index, route) in routes.iter().enumerate() {
            if route.id.is_empty() {
                continue;
            }
            if let Some(first) = seen.insert(route.id.as_str(), index) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "Duplicate route id '{}' (routes[{first}] and routes[{index}])",
                        route.id
                    ),
                });
            }
        }

        for (i, earlier) in routes.iter().enumerate() {
            for later in routes.iter().skip(i + 1) {
                if Self::shadows(earlier, later) {
                    tracing::warn!(
                        shadowing = %earlier.id,
                        shadowed = %later.id,
                        "Route is unreachable for some methods: an earlier route covers its prefix"
                    );
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Whether every path of `later` is also covered by `earlier` for a shared method.
    fn shadows(earlier: &RouteConfig, later: &RouteConfig) -> bool {
        let shares_method = earlier.matcher.methods.iter().any(|m| {
            later
                .matcher
                .methods
                .iter()
                .any(|n| n.eq_ignore_ascii_case(m))
        });
        if !shares_method {
            return false;
        }

        let outer = earlier.matcher.path_prefix.trim().trim_end_matches('/');
        let inner = later.matcher.path_prefix.trim().trim_end_matches('/');
        if outer.is_empty() {
            return true;
        }
        match inner.strip_prefix(outer) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .route(RouteConfig::new("echo", "/v1/echo", &["GET"], "http://localhost:9000"))
            .build()
            .unwrap()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_missing_routes() {
        let mut config = minimal_valid_config();
        config.routes.clear();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_route_ids() {
        let mut config = minimal_valid_config();
        config.routes.push(RouteConfig::new(
            "echo",
            "/v2/echo",
            &["GET"],
            "http://localhost:9000",
        ));

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate route id 'echo'"));
    }

    #[test]
    fn validate_allows_shadowed_prefixes() {
        let mut config = minimal_valid_config();
        config.routes.insert(
            0,
            RouteConfig::new("v1", "/v1", &["GET"], "http://localhost:9001"),
        );
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_bad_upstream_scheme() {
        let mut config = minimal_valid_config();
        config.routes[0].upstream.url = "ftp://localhost".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_relative_prefix_and_empty_methods() {
        let mut config = minimal_valid_config();
        config.routes[0].matcher.path_prefix = "v1/echo".to_string();
        config.routes[0].matcher.methods.clear();

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Found 2 validation errors"));
    }

    #[test]
    fn validate_rejects_negative_policy() {
        let mut config = minimal_valid_config();
        config.routes[0] = config.routes[0].clone().with_override("alice", -1, 5);
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_invalid_header_name() {
        let mut config = minimal_valid_config();
        config.auth.header = "X API Key".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let mut config = minimal_valid_config();
        config.server.listen_addr = "localhost".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }
}
