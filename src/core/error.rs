//! Gateway-originated error responses.
//!
//! Every failure a pipeline stage can answer itself maps onto one
//! [`GatewayError`] variant. The JSON body shape
//! `{"error":{"code":..,"message":..}}` and the `code` strings are part of the
//! client contract and must stay stable.
use axum::{
    Json,
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failures a stage of the request pipeline translates into a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GatewayError {
    /// Credential header absent or blank
    #[error("Provide API key in {header}")]
    MissingCredential { header: String },

    /// Credential presented but not known to the credential store
    #[error("API key not recognized")]
    InvalidCredential,

    /// No configured route accepts this method/path pair
    #[error("no matching route")]
    NoRoute,

    /// Request body larger than the configured ceiling
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },

    /// Token bucket for the caller is empty
    #[error("Too many requests")]
    RateLimited,

    /// The rate limiter failed internally
    #[error("internal rate limiter error")]
    RateLimiterFailure,

    /// The dispatcher ran without a resolved route
    #[error("route not in context")]
    MissingRouteContext,

    /// Upstream could not be reached or the exchange broke before a response
    #[error("upstream request failed")]
    UpstreamUnavailable,

    /// Upstream did not answer within the route deadline
    #[error("upstream did not respond in time")]
    UpstreamTimeout,

    /// Anything else, including contained panics
    #[error("internal server error")]
    Internal,
}

impl GatewayError {
    /// Stable machine-readable code placed in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential { .. } => "missing_api_key",
            GatewayError::InvalidCredential => "invalid_api_key",
            GatewayError::NoRoute => "no_route",
            GatewayError::BodyTooLarge { .. } => "body_too_large",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::RateLimiterFailure => "rate_limiter_error",
            GatewayError::MissingRouteContext => "no_route_ctx",
            GatewayError::UpstreamUnavailable => "upstream_unavailable",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::Internal => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredential { .. } | GatewayError::InvalidCredential => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::NoRoute => StatusCode::NOT_FOUND,
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RateLimiterFailure
            | GatewayError::MissingRouteContext
            | GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        // Json sets `Content-Type: application/json` itself
        (self.status_code(), Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::header;
    use http_body_util::BodyExt;

    use super::*;

    async fn body_json(err: GatewayError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_wire_shape_is_stable() {
        let (status, body) = body_json(GatewayError::NoRoute).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            serde_json::json!({"error": {"code": "no_route", "message": "no matching route"}})
        );
    }

    #[tokio::test]
    async fn test_missing_credential_names_header() {
        let (status, body) = body_json(GatewayError::MissingCredential {
            header: "X-API-Key".to_string(),
        })
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "missing_api_key");
        assert_eq!(body["error"]["message"], "Provide API key in X-API-Key");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::RateLimiterFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(GatewayError::RateLimiterFailure.code(), "rate_limiter_error");
        assert_eq!(
            GatewayError::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::BodyTooLarge { limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_json_content_type() {
        let response = GatewayError::InvalidCredential.into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
