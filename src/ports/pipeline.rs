//! Ports for the request-processing pipeline.
//!
//! A [`RequestHandler`] turns a request plus its [`RequestContext`] into a
//! response. A [`Middleware`] stage does the same but is additionally handed
//! the next handler, which it may call (pass through) or skip (short-circuit).
//! [`wrap`](dyn Middleware::wrap) fuses a stage with its successor into a new
//! handler, which is how chains are assembled.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

use crate::core::RequestContext;

/// RequestHandler defines the port for anything that can answer a request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request, reading and enriching its per-request metadata
    ///
    /// Handlers never fail: every error is already translated into a response.
    async fn handle(&self, req: Request<Body>, ctx: &mut RequestContext) -> Response<Body>;
}

/// Middleware defines the port for one stage of the pipeline
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Stage name used in logs
    fn name(&self) -> &'static str;

    /// Process a request, calling `next` to pass control inward
    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
        next: &dyn RequestHandler,
    ) -> Response<Body>;
}

impl dyn Middleware {
    /// Produce the handler that runs this stage in front of `next`.
    pub fn wrap(self: Arc<Self>, next: Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler> {
        Arc::new(Wrapped { stage: self, next })
    }
}

struct Wrapped {
    stage: Arc<dyn Middleware>,
    next: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for Wrapped {
    async fn handle(&self, req: Request<Body>, ctx: &mut RequestContext) -> Response<Body> {
        self.stage.handle(req, ctx, self.next.as_ref()).await
    }
}
