use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_STREAMS: OnceLock<IntGauge> = OnceLock::new();
static INIT: OnceLock<()> = OnceLock::new();

/// Registers the gateway metrics. Safe to call more than once.
pub fn init_metrics() {
    INIT.get_or_init(|| {
        let duration = REQUEST_DURATION.get_or_init(|| {
            HistogramVec::new(
                prometheus::HistogramOpts::new(
                    "http_request_duration_seconds",
                    "Duration of HTTP requests",
                ),
                &["method", "path"],
            )
            .expect("static histogram definition is valid")
        });
        let req_counter = REQ_COUNTER.get_or_init(|| {
            IntCounterVec::new(
                prometheus::opts!("requests_total", "Total requests per route"),
                &["route", "status"],
            )
            .expect("static counter definition is valid")
        });
        let active_streams = ACTIVE_STREAMS.get_or_init(|| {
            IntGauge::new("active_streams", "Open streaming responses")
                .expect("static gauge definition is valid")
        });

        REGISTRY.register(Box::new(duration.clone())).ok();
        REGISTRY.register(Box::new(req_counter.clone())).ok();
        REGISTRY.register(Box::new(active_streams.clone())).ok();
    });
}

pub fn observe_request(method: &str, path: &str, seconds: f64) {
    if let Some(histogram) = REQUEST_DURATION.get() {
        histogram.with_label_values(&[method, path]).observe(seconds);
    }
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.inc();
    }
}

pub fn dec_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.dec();
    }
}

/// Keeps `active_streams` raised for as long as it is alive.
pub struct StreamGuard(());

impl StreamGuard {
    pub fn new() -> Self {
        inc_streams();
        Self(())
    }
}

impl Default for StreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        dec_streams();
    }
}

/// Records duration and status per matched route.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(request).await;

    observe_request(&method, &path, started.elapsed().as_secs_f64());
    inc_request(&path, response.status().as_str());
    response
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}
