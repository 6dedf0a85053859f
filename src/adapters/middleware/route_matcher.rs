use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use hyper::{Request, Response};

use super::ExemptPaths;
use crate::{
    core::{GatewayError, RequestContext, Router},
    ports::pipeline::{Middleware, RequestHandler},
};

/// Resolves the route for the request, answering 404 when none matches.
pub struct RouteMatcher {
    router: Arc<Router>,
    exempt: Arc<ExemptPaths>,
}

impl RouteMatcher {
    pub fn new(router: Arc<Router>, exempt: Arc<ExemptPaths>) -> Self {
        Self { router, exempt }
    }
}

#[async_trait]
impl Middleware for RouteMatcher {
    fn name(&self) -> &'static str {
        "route_matcher"
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
        next: &dyn RequestHandler,
    ) -> Response<Body> {
        let path = req.uri().path();
        if self.exempt.contains(path) {
            return next.handle(req, ctx).await;
        }

        match self.router.find_matching_route(req.method().as_str(), path) {
            Some(route) => {
                tracing::Span::current().record("route.id", route.id.as_str());
                ctx.route = Some(route);
                next.handle(req, ctx).await
            }
            None => {
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let known: Vec<String> = self
                        .router
                        .routes()
                        .iter()
                        .map(|route| format!("{:?}", route.prefix))
                        .collect();
                    tracing::debug!(
                        method = %req.method(),
                        path = %path,
                        known_prefixes = %known.join(","),
                        "No route matched"
                    );
                }
                GatewayError::NoRoute.into_response()
            }
        }
    }
}
