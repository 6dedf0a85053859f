use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    BoxError,
    body::Body,
    response::IntoResponse,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{Request, Response, header};

use super::ExemptPaths;
use crate::{
    core::{GatewayError, RequestContext},
    ports::{
        http_client::BodyLimitExceeded,
        pipeline::{Middleware, RequestHandler},
    },
};

/// Caps the request body at `max_bytes`; `0` disables the cap.
///
/// A declared `Content-Length` above the cap is answered with 413 straight
/// away. Otherwise the body is wrapped so that reading past the cap fails
/// with [`BodyLimitExceeded`], which the dispatcher turns into the same 413.
pub struct BodyLimit {
    max_bytes: u64,
    exempt: Arc<ExemptPaths>,
}

impl BodyLimit {
    pub fn new(max_bytes: u64, exempt: Arc<ExemptPaths>) -> Self {
        Self { max_bytes, exempt }
    }

    fn declared_length(req: &Request<Body>) -> Option<u64> {
        req.headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    fn limit_body(body: Body, limit: u64) -> Body {
        let limited = Limited::new(body, usize::try_from(limit).unwrap_or(usize::MAX));
        Body::new(limited.map_err(move |err: BoxError| -> BoxError {
            if err.is::<LengthLimitError>() {
                Box::new(BodyLimitExceeded { limit })
            } else {
                err
            }
        }))
    }
}

#[async_trait]
impl Middleware for BodyLimit {
    fn name(&self) -> &'static str {
        "body_limit"
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
        next: &dyn RequestHandler,
    ) -> Response<Body> {
        if self.max_bytes == 0 || self.exempt.contains(req.uri().path()) {
            return next.handle(req, ctx).await;
        }

        if let Some(declared) = Self::declared_length(&req) {
            if declared > self.max_bytes {
                tracing::debug!(
                    declared,
                    limit = self.max_bytes,
                    "Rejecting request with oversized Content-Length"
                );
                return GatewayError::BodyTooLarge {
                    limit: self.max_bytes,
                }
                .into_response();
            }
        }

        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, Self::limit_body(body, self.max_bytes));
        next.handle(req, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use hyper::StatusCode;

    use super::*;
    use crate::adapters::middleware::{Chain, test_support::Reflect};

    fn handler(max_bytes: u64) -> Arc<dyn RequestHandler> {
        let exempt = Arc::new(ExemptPaths::new(["/health"]));
        Chain::new()
            .with(BodyLimit::new(max_bytes, exempt))
            .then(Arc::new(Reflect))
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_rejected() {
        let req = Request::builder()
            .uri("/upload")
            .header(header::CONTENT_LENGTH, "11")
            .body(Body::from("hello world"))
            .unwrap();
        let mut ctx = RequestContext::default();

        let response = handler(10).handle(req, &mut ctx).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_streamed_overrun_fails_with_limit() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::convert::Infallible>("hello "),
            Ok("world"),
        ]);
        let req = Request::builder()
            .uri("/upload")
            .body(Body::from_stream(chunks))
            .unwrap();
        let mut ctx = RequestContext::default();

        let response = handler(8).handle(req, &mut ctx).await;
        let err = response.into_body().collect().await.unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(
            source.downcast_ref::<BodyLimitExceeded>(),
            Some(&BodyLimitExceeded { limit: 8 })
        );
    }

    #[tokio::test]
    async fn test_within_limit_passes_through() {
        let req = Request::builder()
            .uri("/upload")
            .body(Body::from("small"))
            .unwrap();
        let mut ctx = RequestContext::default();

        let response = handler(10).handle(req, &mut ctx).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"small");
    }

    #[tokio::test]
    async fn test_zero_disables_limit_and_exempt_paths_skip() {
        let big = "x".repeat(64);
        let mut ctx = RequestContext::default();

        let req = Request::builder()
            .uri("/upload")
            .header(header::CONTENT_LENGTH, "64")
            .body(Body::from(big.clone()))
            .unwrap();
        assert_eq!(handler(0).handle(req, &mut ctx).await.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/health")
            .header(header::CONTENT_LENGTH, "64")
            .body(Body::from(big))
            .unwrap();
        assert_eq!(handler(8).handle(req, &mut ctx).await.status(), StatusCode::OK);
    }
}
