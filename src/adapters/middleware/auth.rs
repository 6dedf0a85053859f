use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use hyper::{Request, Response};

use super::ExemptPaths;
use crate::{
    core::{GatewayError, RequestContext},
    metrics,
    ports::{
        credential_store::CredentialStore,
        pipeline::{Middleware, RequestHandler},
    },
};

/// API key gate: resolves the presented secret to an identity or answers 401.
pub struct Authenticate {
    store: Arc<dyn CredentialStore>,
    exempt: Arc<ExemptPaths>,
}

impl Authenticate {
    pub fn new(store: Arc<dyn CredentialStore>, exempt: Arc<ExemptPaths>) -> Self {
        Self { store, exempt }
    }

    fn reject(&self, error: GatewayError) -> Response<Body> {
        metrics::increment_auth_failures(error.code());
        error.into_response()
    }
}

#[async_trait]
impl Middleware for Authenticate {
    fn name(&self) -> &'static str {
        "auth"
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

        let header = self.store.header_name();
        // Non-visible-ASCII values can never match a configured key
        let secret = req
            .headers()
            .get(header)
            .map(|value| value.to_str().unwrap_or("\u{0}").trim())
            .unwrap_or("");

        if secret.is_empty() {
            return self.reject(GatewayError::MissingCredential {
                header: self.store.header_label().to_string(),
            });
        }

        match self.store.lookup(secret) {
            Some(identity) => {
                ctx.identity = Some(identity);
                next.handle(req, ctx).await
            }
            None => {
                tracing::debug!(route = ctx.route_id().unwrap_or("-"), "Unknown API key");
                self.reject(GatewayError::InvalidCredential)
            }
        }
    }
}
