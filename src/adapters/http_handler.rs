use std::{any::Any, fmt::Write as _, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router as AxumRouter,
    body::Body as AxumBody,
    extract::{ConnectInfo, State},
    http::header,
    response::IntoResponse,
};
use eyre::Result;
use hyper::{Request, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{catch_panic::CatchPanicLayer, timeout::RequestBodyTimeoutLayer};

use crate::{
    adapters::{
        StaticCredentialStore,
        middleware::{
            AccessLog, Authenticate, BodyLimit, Chain, ExemptPaths, RateLimit, RouteMatcher,
        },
        proxy::ProxyDispatcher,
    },
    config::models::GatewayConfig,
    core::{GatewayError, Policy, RequestContext, Router},
    ports::{http_client::HttpClient, pipeline::RequestHandler, rate_limiter::RateLimiter},
};

pub const HEALTH_PATH: &str = "/health";
pub const VERSION_PATH: &str = "/version";
pub const DEBUG_MATCH_PATH: &str = "/debug/match";
pub const DEBUG_ROUTER_PATH: &str = "/debug/router";

/// Endpoints answered by the gateway itself instead of an upstream.
pub struct OperationalEndpoints {
    router: Arc<Router>,
    debug_endpoints: bool,
    prometheus: Option<(String, PrometheusHandle)>,
}

impl OperationalEndpoints {
    pub fn new(
        router: Arc<Router>,
        debug_endpoints: bool,
        prometheus: Option<(String, PrometheusHandle)>,
    ) -> Self {
        Self {
            router,
            debug_endpoints,
            prometheus,
        }
    }

    /// Every path served here, for the gated stages to skip.
    pub fn exempt_paths(&self) -> ExemptPaths {
        let mut paths = vec![HEALTH_PATH.to_string(), VERSION_PATH.to_string()];
        if self.debug_endpoints {
            paths.push(DEBUG_MATCH_PATH.to_string());
            paths.push(DEBUG_ROUTER_PATH.to_string());
        }
        if let Some((path, _)) = &self.prometheus {
            paths.push(path.clone());
        }
        ExemptPaths::new(paths)
    }

    pub fn serve(&self, req: &Request<AxumBody>) -> Response<AxumBody> {
        let path = req.uri().path();
        match path {
            HEALTH_PATH => (
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"ok":true}"#,
            )
                .into_response(),
            VERSION_PATH => env!("CARGO_PKG_VERSION").into_response(),
            DEBUG_MATCH_PATH if self.debug_endpoints => self.debug_match(req.uri().query()),
            DEBUG_ROUTER_PATH if self.debug_endpoints => self.debug_router(),
            _ => match &self.prometheus {
                Some((metrics_path, handle)) if metrics_path == path => (
                    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    handle.render(),
                )
                    .into_response(),
                _ => GatewayError::NoRoute.into_response(),
            },
        }
    }

    /// `GET /debug/match?method=GET&path=/v1/echo/hello`
    fn debug_match(&self, query: Option<&str>) -> Response<AxumBody> {
        let mut method = "GET".to_string();
        let mut path = "/v1/echo/hello".to_string();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "method" if !value.is_empty() => method = value.into_owned(),
                "path" if !value.is_empty() => path = value.into_owned(),
                _ => {}
            }
        }

        let mut out = String::new();
        match self.router.find_matching_route(&method, &path) {
            Some(route) => {
                let _ = writeln!(out, "MATCHED");
                let _ = writeln!(out, "route.id={}", route.id);
                let _ = writeln!(out, "route.prefix={:?}", route.prefix);
                let _ = writeln!(out, "route.prefix_len={}", route.prefix.len());
                let _ = writeln!(out, "route.upstream={}", route.upstream_origin());
            }
            None => {
                let _ = writeln!(out, "NO MATCH");
                let _ = writeln!(out, "method={method}");
                let _ = writeln!(out, "path={path:?}");
                let _ = writeln!(out, "path_len={}", path.len());
            }
        }
        plain_text(out)
    }

    fn debug_router(&self) -> Response<AxumBody> {
        let routes = self.router.routes();
        let mut out = format!("router.routes_count={}\n", routes.len());
        for (i, route) in routes.iter().enumerate() {
            let mut methods: Vec<&str> = route.methods.iter().map(String::as_str).collect();
            methods.sort_unstable();
            let _ = write!(
                out,
                "\n[{i}] id={}\n  prefix={:?}\n  prefix_len={}\n  methods_keys=[{}]\n  upstream={}\n  timeout_ms={}\n",
                route.id,
                route.prefix,
                route.prefix.len(),
                methods.join(","),
                route.upstream_origin(),
                route.timeout.as_millis()
            );
        }
        plain_text(out)
    }
}

fn plain_text(body: String) -> Response<AxumBody> {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// Innermost handler of the chain: operational endpoints or the proxy.
struct GatewayTerminal {
    ops: Arc<OperationalEndpoints>,
    exempt: Arc<ExemptPaths>,
    proxy: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for GatewayTerminal {
    async fn handle(&self, req: Request<AxumBody>, ctx: &mut RequestContext) -> Response<AxumBody> {
        if self.exempt.contains(req.uri().path()) {
            return self.ops.serve(&req);
        }
        self.proxy.handle(req, ctx).await
    }
}

/// HTTP handler for the Portcullis API Gateway
pub struct HttpHandler {
    pipeline: Arc<dyn RequestHandler>,
    ops: Arc<OperationalEndpoints>,
    exempt: Arc<ExemptPaths>,
    log_operational_endpoints: bool,
}

impl HttpHandler {
    /// Close `chain` over the operational endpoints and `proxy`.
    pub fn new(
        chain: Chain,
        proxy: Arc<dyn RequestHandler>,
        ops: Arc<OperationalEndpoints>,
        log_operational_endpoints: bool,
    ) -> Self {
        let exempt = Arc::new(ops.exempt_paths());
        tracing::debug!(
            stages = ?chain.stage_names(),
            exempt = ?exempt.iter().collect::<Vec<_>>(),
            "Assembled request pipeline"
        );
        let terminal = Arc::new(GatewayTerminal {
            ops: ops.clone(),
            exempt: exempt.clone(),
            proxy,
        });
        Self {
            pipeline: chain.then(terminal),
            ops,
            exempt,
            log_operational_endpoints,
        }
    }

    /// Build the standard gateway from configuration.
    pub fn from_config(
        config: &GatewayConfig,
        client: Arc<dyn HttpClient>,
        limiter: Arc<dyn RateLimiter>,
        prometheus: Option<PrometheusHandle>,
    ) -> Result<Self> {
        let router = Arc::new(Router::from_config(&config.routes)?);
        let credentials = Arc::new(StaticCredentialStore::from_config(&config.auth)?);
        let prometheus = prometheus
            .filter(|_| config.observability.metrics_enabled)
            .map(|handle| (config.observability.prometheus_path.clone(), handle));

        let ops = Arc::new(OperationalEndpoints::new(
            router.clone(),
            config.server.debug_endpoints,
            prometheus,
        ));
        let exempt = Arc::new(ops.exempt_paths());
        let default_policy = Policy::from(&config.limits.default);

        let chain = Chain::new()
            .with(AccessLog)
            .with(BodyLimit::new(config.server.max_body_bytes, exempt.clone()))
            .with(RouteMatcher::new(router, exempt.clone()))
            .with(Authenticate::new(credentials, exempt.clone()))
            .with(RateLimit::new(limiter, default_policy, exempt));

        Ok(Self::new(
            chain,
            Arc::new(ProxyDispatcher::new(client)),
            ops,
            config.observability.log_operational_endpoints,
        ))
    }

    /// Main request handler: operational endpoints bypass the chain unless they are logged.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        if !self.log_operational_endpoints && self.exempt.contains(req.uri().path()) {
            return self.ops.serve(&req);
        }

        let mut ctx = RequestContext::new(client_addr);
        self.pipeline.handle(req, &mut ctx).await
    }
}

async fn serve(
    State(handler): State<Arc<HttpHandler>>,
    req: Request<AxumBody>,
) -> Response<AxumBody> {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    handler.handle_request(req, client_addr).await
}

/// Turn a panic in one request's processing into a 500 for that request only.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<AxumBody> {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(panic = %details, "Request handler panicked");
    GatewayError::Internal.into_response()
}

/// Assemble the axum application serving every path through `handler`.
///
/// `read_timeout` bounds the gap between request body chunks.
pub fn build_app(handler: Arc<HttpHandler>, read_timeout: Duration) -> AxumRouter {
    AxumRouter::new()
        .fallback(serve)
        .with_state(handler)
        .layer(RequestBodyTimeoutLayer::new(read_timeout))
        .layer(CatchPanicLayer::custom(panic_response))
}
