use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{
    BodyLimitExceeded, HttpClient, HttpClientError, HttpClientResult,
};

/// Connection pool and socket tuning for upstream traffic.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamPoolSettings {
    pub connect_timeout: Duration,
    pub tcp_keepalive: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for UpstreamPoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_keepalive: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 100,
        }
    }
}

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Keeps a pool of keep-alive connections shared by every route
/// * Forces request version to HTTP/1.1 while allowing ALPN to negotiate h2
/// * Leaves the inbound `Host` header alone (hyper only fills it in when absent)
/// * Tells a request-body overrun apart from a genuine connection failure
///
/// Deadlines are owned by the caller; this adapter never times out on its own
/// beyond the connect timeout.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter with the default pool settings.
    pub fn new() -> Result<Self> {
        Self::with_settings(UpstreamPoolSettings::default())
    }

    pub fn with_settings(settings: UpstreamPoolSettings) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(settings.connect_timeout));
        http_connector.set_keepalive(Some(settings.tcp_keepalive));
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(settings.idle_timeout)
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .build::<_, AxumBody>(https_connector);

        tracing::info!(
            connect_timeout_ms = settings.connect_timeout.as_millis() as u64,
            idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
            max_idle_per_host = settings.max_idle_per_host,
            "Created upstream HTTP client"
        );
        Ok(Self { client })
    }

    /// Find a [`BodyLimitExceeded`] anywhere in the source chain of `err`.
    fn body_limit_cause(err: &(dyn StdError + 'static)) -> Option<BodyLimitExceeded> {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(exceeded) = e.downcast_ref::<BodyLimitExceeded>() {
                return Some(*exceeded);
            }
            current = e.source();
        }
        None
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;

        tracing::debug!(
            "Sending request: {} {} (ALPN negotiates actual version)",
            parts.method,
            parts.uri
        );
        tracing::trace!("Outgoing request headers: {:?}", parts.headers);

        let method_for_error_log = parts.method.clone();
        let uri_for_error_log = parts.uri.clone();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (parts, hyper_body) = response.into_parts();
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                if let Some(exceeded) = Self::body_limit_cause(&e) {
                    tracing::debug!(
                        limit = exceeded.limit,
                        "Request body overran its ceiling while being forwarded"
                    );
                    return Err(HttpClientError::BodyTooLarge {
                        limit: exceeded.limit,
                    });
                }

                tracing::warn!(
                    "Error making request to upstream ({} {}): {}",
                    method_for_error_log,
                    uri_for_error_log,
                    e
                );

                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method_for_error_log} {uri_for_error_log} failed: {e}"
                )))
            }
        }
    }
}
