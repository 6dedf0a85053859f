use std::{
    pin::Pin,
    task::{Context, Poll, ready},
    time::Instant,
};

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use hyper::{
    Method, Request, Response,
    body::{Body as HttpBody, Frame, SizeHint},
    header::{self, HeaderName, HeaderValue},
};
use tracing::{Instrument, Span};

use crate::{
    core::RequestContext,
    metrics,
    ports::pipeline::{Middleware, RequestHandler},
    tracing_setup::create_request_span,
};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Outermost stage: one `info` event per request, plus request metrics.
///
/// Reuses an inbound `X-Request-ID` or generates one, and echoes it on the
/// response. Everything downstream runs inside the request span. The event
/// and the metrics are emitted once the response body has been fully sent
/// (or abandoned), so size and duration cover the streamed bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessLog;

impl AccessLog {
    fn request_id(req: &Request<Body>) -> String {
        req.headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Everything the access log line needs apart from the body outcome.
struct AccessRecord {
    span: Span,
    start: Instant,
    method: Method,
    path: String,
    remote: String,
    user_agent: String,
    status: u16,
    route: Option<String>,
    identity: Option<String>,
}

impl AccessRecord {
    fn emit(self, size: u64, completed: bool) {
        let duration = self.start.elapsed();
        let route = self.route.as_deref();

        self.span.record("http.status_code", self.status);
        self.span.record("duration_ms", duration.as_millis() as u64);
        self.span.in_scope(|| {
            tracing::info!(
                method = %self.method,
                path = %self.path,
                remote = %self.remote,
                status = self.status,
                size,
                completed,
                duration_ms = duration.as_secs_f64() * 1000.0,
                route = route.unwrap_or("-"),
                identity = self.identity.as_deref().unwrap_or("-"),
                ua = %self.user_agent,
                "req"
            );
        });

        metrics::increment_request_total(route, self.method.as_str(), self.status);
        metrics::record_request_duration(route, self.method.as_str(), duration);
    }
}

/// Response body that counts data bytes and writes the access record when
/// the stream ends, fails or is dropped early.
struct AccessLogBody {
    inner: Body,
    size: u64,
    record: Option<AccessRecord>,
}

impl AccessLogBody {
    fn finish(&mut self, completed: bool) {
        if let Some(record) = self.record.take() {
            record.emit(self.size, completed);
        }
    }
}

impl HttpBody for AccessLogBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = ready!(Pin::new(&mut self.inner).poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    self.size += data.len() as u64;
                }
                if self.inner.is_end_stream() {
                    self.finish(true);
                }
            }
            Some(Err(_)) => self.finish(false),
            None => self.finish(true),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for AccessLogBody {
    fn drop(&mut self) {
        // an empty body may never be polled
        let completed = self.inner.is_end_stream();
        self.finish(completed);
    }
}

#[async_trait]
impl Middleware for AccessLog {
    fn name(&self) -> &'static str {
        "access_log"
    }

    async fn handle(
        &self,
        req: Request<Body>,
        ctx: &mut RequestContext,
        next: &dyn RequestHandler,
    ) -> Response<Body> {
        let start = Instant::now();
        let request_id = Self::request_id(&req);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let remote = ctx
            .client_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());

        let span = create_request_span(method.as_str(), &path, &request_id);
        ctx.request_id = Some(request_id.clone());

        let response = next.handle(req, ctx).instrument(span.clone()).await;

        let (mut parts, body) = response.into_parts();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            parts.headers.insert(REQUEST_ID_HEADER, value);
        }
        let record = AccessRecord {
            span,
            start,
            method,
            path,
            remote,
            user_agent,
            status: parts.status.as_u16(),
            route: ctx.route_id().map(str::to_string),
            identity: ctx.identity.clone(),
        };
        let body = AccessLogBody {
            inner: body,
            size: 0,
            record: Some(record),
        };
        Response::from_parts(parts, Body::new(body))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        io::{self, Write},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use futures_util::{StreamExt, stream};
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::adapters::middleware::{Chain, test_support::Reflect};

    #[tokio::test]
    async fn test_generates_request_id() {
        let handler = Chain::new().with(AccessLog).then(Arc::new(Reflect));
        let mut ctx = RequestContext::default();

        let response = handler
            .handle(Request::new(Body::from("hi")), &mut ctx)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let echoed = response.headers()["x-request-id"].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(echoed).is_ok());
        assert_eq!(ctx.request_id.as_deref(), Some(echoed));
    }

    #[tokio::test]
    async fn test_reuses_inbound_request_id() {
        let handler = Chain::new().with(AccessLog).then(Arc::new(Reflect));
        let mut ctx = RequestContext::default();
        let req = Request::builder()
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();

        let response = handler.handle(req, &mut ctx).await;
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    struct SlowStream;

    #[async_trait]
    impl RequestHandler for SlowStream {
        async fn handle(&self, _req: Request<Body>, _ctx: &mut RequestContext) -> Response<Body> {
            let chunks = stream::iter(0..3).then(|_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Infallible>(Bytes::from_static(b"0123456789"))
            });
            Response::new(Body::from_stream(chunks))
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn access_lines(&self) -> Vec<serde_json::Value> {
            let raw = self.0.lock().unwrap().clone();
            String::from_utf8(raw)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
                .filter(|line| line["fields"]["message"] == "req")
                .collect()
        }
    }

    #[tokio::test]
    async fn test_streamed_body_is_logged_after_last_chunk() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        let _subscriber = tracing::subscriber::set_default(subscriber);

        let recorder = PrometheusBuilder::new().build_recorder();
        let scrape = recorder.handle();
        let _recorder = ::metrics::set_default_local_recorder(&recorder);

        let handler = Chain::new().with(AccessLog).then(Arc::new(SlowStream));
        let mut ctx = RequestContext::default();
        let response = handler
            .handle(Request::new(Body::empty()), &mut ctx)
            .await;

        assert!(response.headers().contains_key("x-request-id"));
        assert!(captured.access_lines().is_empty());
        assert!(!scrape.render().contains("portcullis_requests_total{"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.len(), 30);

        let lines = captured.access_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["fields"]["size"], 30);
        assert_eq!(lines[0]["fields"]["completed"], true);
        assert!(lines[0]["fields"]["duration_ms"].as_f64().unwrap() >= 250.0);
        assert!(scrape.render().contains("portcullis_requests_total{"));
    }

    #[tokio::test]
    async fn test_abandoned_body_is_logged_once_on_drop() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        let _subscriber = tracing::subscriber::set_default(subscriber);

        let handler = Chain::new().with(AccessLog).then(Arc::new(SlowStream));
        let mut ctx = RequestContext::default();
        let response = handler
            .handle(Request::new(Body::empty()), &mut ctx)
            .await;

        let mut body = response.into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap().len(), 10);
        drop(body);

        let lines = captured.access_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["fields"]["size"], 10);
        assert_eq!(lines[0]["fields"]["completed"], false);
    }
}
