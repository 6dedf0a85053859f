//! Terminal pipeline stage: forward the request to the matched route's upstream.
//!
//! The route timeout is one deadline measured from the moment dispatch starts.
//! It bounds the wait for response headers (expiry there answers 504) and the
//! streaming of the response body (expiry there aborts the stream, which the
//! server turns into a reset connection for the client).
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use async_trait::async_trait;
use axum::{
    body::{Body, BodyDataStream},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use hyper::{
    HeaderMap, Request, Response, Uri,
    header::{self, HeaderName, HeaderValue},
};
use tokio::time::{Instant, Sleep, sleep_until, timeout_at};
use tracing::Instrument;

use crate::{
    core::{GatewayError, RequestContext, Route},
    metrics,
    ports::{
        http_client::{HttpClient, HttpClientError},
        pipeline::RequestHandler,
    },
    tracing_setup::create_upstream_span,
};

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers describing a single connection rather than the message.
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests to upstreams through an [`HttpClient`].
pub struct ProxyDispatcher {
    client: Arc<dyn HttpClient>,
}

impl ProxyDispatcher {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequestHandler for ProxyDispatcher {
    async fn handle(&self, req: Request<Body>, ctx: &mut RequestContext) -> Response<Body> {
        let Some(route) = ctx.route.clone() else {
            tracing::error!(
                path = %req.uri().path(),
                "Proxy dispatcher reached without a resolved route"
            );
            return GatewayError::MissingRouteContext.into_response();
        };

        let deadline = Instant::now() + route.timeout;

        let outbound = match rewrite_request(req, &route, ctx.client_addr) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::error!(
                    route.id = %route.id,
                    error = %e,
                    "Failed to build upstream request"
                );
                metrics::increment_upstream_errors(&route.id, "invalid_request");
                return GatewayError::UpstreamUnavailable.into_response();
            }
        };

        let span = create_upstream_span(
            &route.id,
            &route.upstream_origin(),
            outbound.method().as_str(),
        );
        let timer = metrics::UpstreamTimer::new(&route.id);
        let result = timeout_at(deadline, self.client.send_request(outbound))
            .instrument(span.clone())
            .await;
        let elapsed_ms = timer.elapsed().as_millis() as u64;
        drop(timer);

        match result {
            Err(_) => {
                tracing::warn!(
                    route.id = %route.id,
                    timeout_ms = route.timeout.as_millis() as u64,
                    "Upstream did not send response headers before the deadline"
                );
                metrics::increment_upstream_errors(&route.id, "timeout");
                GatewayError::UpstreamTimeout.into_response()
            }
            Ok(Err(HttpClientError::BodyTooLarge { limit })) => {
                tracing::info!(route.id = %route.id, limit, "Request body overran its ceiling");
                metrics::increment_upstream_errors(&route.id, "body_too_large");
                GatewayError::BodyTooLarge { limit }.into_response()
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    route.id = %route.id,
                    error = %e,
                    elapsed_ms,
                    "Upstream request failed"
                );
                let kind = match e {
                    HttpClientError::InvalidRequest(_) => "invalid_request",
                    _ => "connect",
                };
                metrics::increment_upstream_errors(&route.id, kind);
                GatewayError::UpstreamUnavailable.into_response()
            }
            Ok(Ok(response)) => {
                let status = response.status();
                span.record("http.status_code", status.as_u16());
                tracing::debug!(
                    route.id = %route.id,
                    status = status.as_u16(),
                    elapsed_ms,
                    "Upstream responded"
                );
                metrics::increment_upstream_requests(&route.id, status.as_u16());

                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                let body =
                    DeadlineStream::new(body.into_data_stream(), deadline, route.id.clone());
                Response::from_parts(parts, Body::from_stream(body))
            }
        }
    }
}

/// Point the request at the route's upstream, keeping path, query and `Host`.
fn rewrite_request(
    req: Request<Body>,
    route: &Route,
    client_addr: Option<SocketAddr>,
) -> Result<Request<Body>, hyper::http::Error> {
    let (mut parts, body) = req.into_parts();

    let forwarded_host = parts
        .headers
        .get(header::HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        });
    let forwarded_proto = parts.uri.scheme_str().unwrap_or("http").to_string();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = format!("{}{}", route.upstream_origin(), path_and_query).parse::<Uri>()?;

    strip_hop_by_hop(&mut parts.headers);

    if let Some(host) = forwarded_host {
        parts.headers.insert(X_FORWARDED_HOST, host);
    }
    parts
        .headers
        .insert(X_FORWARDED_PROTO, HeaderValue::from_str(&forwarded_proto)?);

    if let Some(addr) = client_addr {
        let ip = addr.ip().to_string();
        let forwarded_for = match parts
            .headers
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(prior) if !prior.trim().is_empty() => format!("{prior}, {ip}"),
            _ => ip,
        };
        parts
            .headers
            .insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);
    }

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// The route deadline passed while the upstream body was still streaming.
#[derive(Debug, thiserror::Error)]
#[error("upstream body for route {route_id} exceeded its deadline")]
pub struct UpstreamDeadlineExceeded {
    pub route_id: String,
}

/// Response body stream that fails once `deadline` passes.
struct DeadlineStream {
    inner: BodyDataStream,
    deadline: Pin<Box<Sleep>>,
    route_id: String,
    finished: bool,
}

impl DeadlineStream {
    fn new(inner: BodyDataStream, deadline: Instant, route_id: String) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            route_id,
            finished: false,
        }
    }
}

impl Stream for DeadlineStream {
    type Item = Result<Bytes, axum::BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        // An always-ready upstream never lets the timer driver run, so compare the clock too.
        let expired = Instant::now() >= self.deadline.deadline();
        if expired || self.deadline.as_mut().poll(cx).is_ready() {
            self.finished = true;
            tracing::warn!(
                route.id = %self.route_id,
                "Upstream body exceeded the route deadline"
            );
            metrics::increment_upstream_errors(&self.route_id, "timeout");
            let err = UpstreamDeadlineExceeded {
                route_id: self.route_id.clone(),
            };
            return Poll::Ready(Some(Err(err.into())));
        }

        let item = ready!(self.inner.poll_next_unpin(cx));
        if item.is_none() {
            self.finished = true;
        }
        Poll::Ready(item.map(|chunk| chunk.map_err(Into::into)))
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, sync::Mutex, time::Duration};

    use axum::http::StatusCode;
    use futures_util::stream;
    use http_body_util::BodyExt;
    use url::Url;

    use super::*;
    use crate::ports::http_client::HttpClientResult;

    enum Behaviour {
        Respond(&'static str),
        Stall,
        StallBody,
        Fail,
        Overrun(u64),
        Flood,
    }

    struct FakeClient {
        behaviour: Behaviour,
        seen: Mutex<Option<hyper::http::request::Parts>>,
    }

    impl FakeClient {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                seen: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            let (parts, _body) = req.into_parts();
            *self.seen.lock().unwrap() = Some(parts);
            match self.behaviour {
                Behaviour::Respond(text) => Ok(Response::builder()
                    .status(StatusCode::CREATED)
                    .header("x-upstream", "yes")
                    .header(header::CONNECTION, "close")
                    .body(Body::from(text))
                    .unwrap()),
                Behaviour::Stall => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    unreachable!("deadline fires first")
                }
                Behaviour::StallBody => {
                    let chunks =
                        stream::once(async { Ok::<_, Infallible>(Bytes::from("partial")) })
                            .chain(stream::pending());
                    Ok(Response::new(Body::from_stream(chunks)))
                }
                Behaviour::Flood => {
                    let chunks = stream::repeat_with(|| Ok::<_, Infallible>(Bytes::from("x")));
                    Ok(Response::new(Body::from_stream(chunks)))
                }
                Behaviour::Fail => Err(HttpClientError::ConnectionError("refused".into())),
                Behaviour::Overrun(limit) => Err(HttpClientError::BodyTooLarge { limit }),
            }
        }
    }

    fn context(timeout: Duration) -> RequestContext {
        let route = Route::new(
            "echo",
            ["GET"],
            "/v1/echo",
            Url::parse("http://upstream.internal:9000").unwrap(),
        )
        .with_timeout(timeout);
        RequestContext {
            route: Some(Arc::new(route)),
            client_addr: Some("10.1.2.3:5555".parse().unwrap()),
            ..RequestContext::default()
        }
    }

    fn request() -> Request<Body> {
        Request::builder()
            .uri("/v1/echo/hello?x=1")
            .header(header::HOST, "gateway.example")
            .header("x-forwarded-for", "192.0.2.1")
            .header(header::CONNECTION, "keep-alive, x-secret")
            .header("x-secret", "drop me")
            .header("x-api-key", "secret123")
            .body(Body::empty())
            .unwrap()
    }

    async fn error_code(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["error"]["code"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_missing_route_is_internal_error() {
        let dispatcher = ProxyDispatcher::new(FakeClient::new(Behaviour::Respond("ok")));
        let mut ctx = RequestContext::default();

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(response).await, "no_route_ctx");
    }

    #[tokio::test]
    async fn test_rewrites_target_and_forwarding_headers() {
        let client = FakeClient::new(Behaviour::Respond("hello from upstream"));
        let dispatcher = ProxyDispatcher::new(client.clone());
        let mut ctx = context(Duration::from_secs(3));

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert!(response.headers().get(header::CONNECTION).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello from upstream");

        let seen = client.seen.lock().unwrap().take().unwrap();
        assert_eq!(
            seen.uri.to_string(),
            "http://upstream.internal:9000/v1/echo/hello?x=1"
        );
        assert_eq!(seen.headers[header::HOST], "gateway.example");
        assert_eq!(seen.headers["x-forwarded-host"], "gateway.example");
        assert_eq!(seen.headers["x-forwarded-proto"], "http");
        assert_eq!(seen.headers["x-forwarded-for"], "192.0.2.1, 10.1.2.3");
        assert_eq!(seen.headers["x-api-key"], "secret123");
        assert!(seen.headers.get(header::CONNECTION).is_none());
        assert!(seen.headers.get("x-secret").is_none());
    }

    #[tokio::test]
    async fn test_deadline_before_headers_is_gateway_timeout() {
        let dispatcher = ProxyDispatcher::new(FakeClient::new(Behaviour::Stall));
        let mut ctx = context(Duration::from_millis(50));

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(error_code(response).await, "upstream_timeout");
    }

    #[tokio::test]
    async fn test_deadline_during_body_aborts_stream() {
        let dispatcher = ProxyDispatcher::new(FakeClient::new(Behaviour::StallBody));
        let mut ctx = context(Duration::from_millis(50));

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
    }

    #[tokio::test]
    async fn test_deadline_cuts_off_always_ready_body() {
        let dispatcher = ProxyDispatcher::new(FakeClient::new(Behaviour::Flood));
        let mut ctx = context(Duration::from_millis(20));

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut chunks = response.into_body().into_data_stream();
        assert!(matches!(chunks.next().await, Some(Err(_))));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_failure_is_bad_gateway() {
        let dispatcher = ProxyDispatcher::new(FakeClient::new(Behaviour::Fail));
        let mut ctx = context(Duration::from_secs(3));

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(error_code(response).await, "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_body_overrun_is_payload_too_large() {
        let dispatcher = ProxyDispatcher::new(FakeClient::new(Behaviour::Overrun(8)));
        let mut ctx = context(Duration::from_secs(3));

        let response = dispatcher.handle(request(), &mut ctx).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error_code(response).await, "body_too_large");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }
}
