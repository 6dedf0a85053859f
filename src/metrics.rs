//! Lightweight metrics helpers for Portcullis.
//!
//! This module exposes a small set of convenience functions and an RAII timer
//! wrapping the `metrics` crate macros. Recording goes through whatever
//! recorder is installed; [`install_prometheus_recorder`] installs the
//! Prometheus one whose rendered text backs the scrape endpoint.
//!
//! Provided metrics (labels vary by family):
//! * `portcullis_requests_total` (counter: route, method, status)
//! * `portcullis_request_duration_seconds` (histogram: route, method)
//! * `portcullis_rate_limited_total` (counter: route)
//! * `portcullis_limiter_errors_total` (counter: route)
//! * `portcullis_auth_failures_total` (counter: reason)
//! * `portcullis_upstream_requests_total` (counter: route, status)
//! * `portcullis_upstream_errors_total` (counter: route, kind)
//! * `portcullis_upstream_duration_seconds` (histogram: route)
//!
//! Requests that never resolved a route are labelled `route="none"`.
use std::time::{Duration, Instant};

use eyre::{Result, WrapErr};
use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;

pub const PORTCULLIS_REQUESTS_TOTAL: &str = "portcullis_requests_total";
pub const PORTCULLIS_REQUEST_DURATION_SECONDS: &str = "portcullis_request_duration_seconds";
pub const PORTCULLIS_RATE_LIMITED_TOTAL: &str = "portcullis_rate_limited_total";
pub const PORTCULLIS_LIMITER_ERRORS_TOTAL: &str = "portcullis_limiter_errors_total";
pub const PORTCULLIS_AUTH_FAILURES_TOTAL: &str = "portcullis_auth_failures_total";
pub const PORTCULLIS_UPSTREAM_REQUESTS_TOTAL: &str = "portcullis_upstream_requests_total";
pub const PORTCULLIS_UPSTREAM_ERRORS_TOTAL: &str = "portcullis_upstream_errors_total";
pub const PORTCULLIS_UPSTREAM_DURATION_SECONDS: &str = "portcullis_upstream_duration_seconds";

/// Label value used when no route was resolved.
pub const NO_ROUTE_LABEL: &str = "none";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        PORTCULLIS_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        PORTCULLIS_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        PORTCULLIS_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected because the caller's token bucket was empty."
    );
    describe_counter!(
        PORTCULLIS_LIMITER_ERRORS_TOTAL,
        Unit::Count,
        "Internal rate limiter failures."
    );
    describe_counter!(
        PORTCULLIS_AUTH_FAILURES_TOTAL,
        Unit::Count,
        "Requests rejected by the API key gate (by reason)."
    );
    describe_counter!(
        PORTCULLIS_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Responses received from upstream services."
    );
    describe_counter!(
        PORTCULLIS_UPSTREAM_ERRORS_TOTAL,
        Unit::Count,
        "Upstream exchanges that produced no response (by kind)."
    );
    describe_histogram!(
        PORTCULLIS_UPSTREAM_DURATION_SECONDS,
        Unit::Seconds,
        "Time until upstream response headers arrived."
    );
});

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
}

/// Install the global Prometheus recorder and describe every metric.
///
/// Fails when another recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install Prometheus recorder")?;
    init_metrics();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

fn route_label(route: Option<&str>) -> String {
    route.unwrap_or(NO_ROUTE_LABEL).to_string()
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(route: Option<&str>, method: &str, status: u16) {
    counter!(
        PORTCULLIS_REQUESTS_TOTAL,
        "route" => route_label(route),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(route: Option<&str>, method: &str, duration: Duration) {
    histogram!(
        PORTCULLIS_REQUEST_DURATION_SECONDS,
        "route" => route_label(route),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_rate_limited(route: Option<&str>) {
    counter!(PORTCULLIS_RATE_LIMITED_TOTAL, "route" => route_label(route)).increment(1);
}

pub fn increment_limiter_errors(route: Option<&str>) {
    counter!(PORTCULLIS_LIMITER_ERRORS_TOTAL, "route" => route_label(route)).increment(1);
}

/// `reason` is the error code, e.g. `missing_api_key`.
pub fn increment_auth_failures(reason: &'static str) {
    counter!(PORTCULLIS_AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn increment_upstream_requests(route: &str, status: u16) {
    counter!(
        PORTCULLIS_UPSTREAM_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// `kind` is one of `timeout`, `connect`, `body_too_large`, `invalid_request`.
pub fn increment_upstream_errors(route: &str, kind: &'static str) {
    counter!(
        PORTCULLIS_UPSTREAM_ERRORS_TOTAL,
        "route" => route.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// RAII helper measuring the wait for upstream response headers.
pub struct UpstreamTimer {
    start: Instant,
    route: String,
}

impl UpstreamTimer {
    pub fn new(route: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        histogram!(
            PORTCULLIS_UPSTREAM_DURATION_SECONDS,
            "route" => self.route.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_render_with_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            init_metrics();
            increment_request_total(Some("echo"), "GET", 200);
            increment_request_total(None, "GET", 404);
            increment_auth_failures("invalid_api_key");
            drop(UpstreamTimer::new("echo"));
        });

        let rendered = handle.render();
        let request_line = rendered
            .lines()
            .find(|line| {
                line.starts_with("portcullis_requests_total{") && line.contains(r#"route="echo""#)
            })
            .unwrap();
        assert!(request_line.contains(r#"status="200""#));
        assert!(request_line.ends_with(" 1"));
        assert!(rendered.contains(r#"route="none""#));
        assert!(rendered.contains(r#"portcullis_auth_failures_total{reason="invalid_api_key"} 1"#));
        assert!(rendered.contains("portcullis_upstream_duration_seconds"));
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }
}
