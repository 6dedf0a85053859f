use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use chrono::Utc;
use hyper::{
    HeaderMap, Request, Response,
    header::{HeaderName, HeaderValue},
};

use super::ExemptPaths;
use crate::{
    core::{Decision, GatewayError, Policy, RequestContext, Route},
    metrics,
    ports::{
        pipeline::{Middleware, RequestHandler},
        rate_limiter::RateLimiter,
    },
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Pick the policy for `identity` on `route`.
///
/// A per-identity override wins over the route policy, which wins over
/// `fallback`; a candidate is only considered when both of its numbers are
/// positive.
pub fn select_policy(route: Option<&Route>, identity: &str, fallback: Policy) -> Policy {
    let Some(route) = route else {
        return fallback;
    };
    route
        .rate_limit_overrides
        .get(identity)
        .copied()
        .filter(Policy::is_enforceable)
        .or_else(|| route.rate_limit.filter(Policy::is_enforceable))
        .unwrap_or(fallback)
}

/// Charges one token per request against `route:identity`.
pub struct RateLimit {
    limiter: Arc<dyn RateLimiter>,
    default_policy: Policy,
    exempt: Arc<ExemptPaths>,
}

impl RateLimit {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        default_policy: Policy,
        exempt: Arc<ExemptPaths>,
    ) -> Self {
        Self {
            limiter,
            default_policy,
            exempt,
        }
    }

    fn set_headers(headers: &mut HeaderMap, decision: &Decision) {
        if decision.limit <= 0 {
            return;
        }
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
        headers.insert(
            X_RATELIMIT_REMAINING,
            HeaderValue::from(decision.remaining.max(0)),
        );
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
    }
}

#[async_trait]
impl Middleware for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
        next: &dyn RequestHandler,
    ) -> Response<Body> {
        if self.exempt.contains(req.uri().path()) {
            return next.handle(req, ctx).await;
        }

        let key = ctx.rate_limit_key();
        let policy = select_policy(
            ctx.route.as_deref(),
            ctx.identity_or_anonymous(),
            self.default_policy,
        );

        let decision = match self.limiter.allow(&key, policy, Utc::now()).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    key = %key,
                    route = ctx.route_id().unwrap_or("-"),
                    error = %e,
                    "Rate limiter failed"
                );
                metrics::increment_limiter_errors(ctx.route_id());
                return GatewayError::RateLimiterFailure.into_response();
            }
        };

        let mut response = if decision.allowed {
            next.handle(req, ctx).await
        } else {
            tracing::debug!(key = %key, limit = decision.limit, "Rate limited");
            metrics::increment_rate_limited(ctx.route_id());
            GatewayError::RateLimited.into_response()
        };

        Self::set_headers(response.headers_mut(), &decision);
        response
    }
}
