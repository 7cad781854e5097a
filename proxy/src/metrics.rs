//! # Prometheus Metrics
//!
//! Operational metrics for the proxy, served as Prometheus text on the
//! dedicated metrics port.
//!
//! Call metrics are pushed by the dispatcher through the
//! [`CallObserver`] hook. Gauges that mirror state owned elsewhere (hub
//! observers, live sessions) are refreshed at scrape time.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use parking_lot::Mutex;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use nvp_core::config::Environment;
use nvp_core::dispatcher::{CallObserver, CallOutcome};
use nvp_core::EventHub;

use crate::session::SessionStore;

#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    /// Serializes the read-then-increment in [`refresh`](Self::refresh).
    sync: Arc<Mutex<()>>,
    /// Upstream calls by method and environment, whatever the outcome.
    pub nvp_calls_total: IntCounterVec,
    /// Calls that got no usable answer (transport error, non-2xx, timeout).
    pub nvp_call_failures_total: IntCounterVec,
    pub nvp_call_latency_seconds: HistogramVec,
    /// Requests refused by the `/nvp/*` rate limiter.
    pub rate_limited_total: IntCounter,
    /// Records ever inserted into the event hub.
    pub log_records_total: IntCounter,
    pub connected_observers: IntGauge,
    pub active_sessions: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let nvp_calls_total = IntCounterVec::new(
            Opts::new("nvp_calls_total", "Upstream NVP calls dispatched"),
            &["method", "environment"],
        )?;
        registry.register(Box::new(nvp_calls_total.clone()))?;

        let nvp_call_failures_total = IntCounterVec::new(
            Opts::new(
                "nvp_call_failures_total",
                "Upstream NVP calls that failed or timed out",
            ),
            &["method", "reason"],
        )?;
        registry.register(Box::new(nvp_call_failures_total.clone()))?;

        let nvp_call_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "nvp_call_latency_seconds",
                "Upstream NVP call latency in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["method"],
        )?;
        registry.register(Box::new(nvp_call_latency_seconds.clone()))?;

        let rate_limited_total =
            IntCounter::new("rate_limited_total", "Requests refused by the rate limiter")?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let log_records_total =
            IntCounter::new("log_records_total", "Records inserted into the event hub")?;
        registry.register(Box::new(log_records_total.clone()))?;

        let connected_observers = IntGauge::new(
            "connected_observers",
            "Live SSE and WebSocket observers",
        )?;
        registry.register(Box::new(connected_observers.clone()))?;

        let active_sessions = IntGauge::new("active_sessions", "Sessions held in memory")?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            sync: Arc::new(Mutex::new(())),
            nvp_calls_total,
            nvp_call_failures_total,
            nvp_call_latency_seconds,
            rate_limited_total,
            log_records_total,
            connected_observers,
            active_sessions,
        })
    }

    /// Sync the mirrored gauges with their owners.
    pub fn refresh(&self, hub: &EventHub, sessions: &SessionStore) {
        let stats = hub.stats();
        self.connected_observers.set(stats.observers as i64);
        self.active_sessions.set(sessions.len() as i64);

        let _guard = self.sync.lock();
        let seen = self.log_records_total.get();
        if stats.inserted_total > seen {
            self.log_records_total.inc_by(stats.inserted_total - seen);
        }
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl CallObserver for ProxyMetrics {
    fn observe(&self, method: &str, environment: Environment, outcome: CallOutcome, elapsed: Duration) {
        self.nvp_calls_total
            .with_label_values(&[method, environment.as_str()])
            .inc();
        self.nvp_call_latency_seconds
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());

        let reason = match outcome {
            CallOutcome::Answered => return,
            CallOutcome::Failed => "upstream",
            CallOutcome::TimedOut => "timeout",
        };
        self.nvp_call_failures_total
            .with_label_values(&[method, reason])
            .inc();
    }
}

/// State of the metrics listener.
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<ProxyMetrics>,
    pub hub: Arc<EventHub>,
    pub sessions: Arc<SessionStore>,
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    state.metrics.refresh(&state.hub, &state.sessions);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
