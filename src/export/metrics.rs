use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for the shipper.
///
/// All metrics use the "logship" namespace. Counters are process-global
/// and safe for unlocked concurrent increment; workers and the shipping
/// client share this struct behind an `Arc`.
pub struct ShipperMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events published across all sources.
    pub published_events: Counter,
    /// Total batch publish failures.
    pub publish_failures: Counter,
    /// Events published, by source.
    pub published_by_source: CounterVec,
    /// Total events dropped by the ignore-older pre-filter.
    pub ignored_events: Counter,
    /// Ignored events, by source.
    pub ignored_by_source: CounterVec,
    /// Bulk items acknowledged by the index service.
    pub acked_events: Counter,
    /// Bulk items that received transient failure statuses.
    pub not_acked_events: Counter,
    /// Total calls into the bulk publish path.
    pub publish_calls: Counter,
    /// Process start time as seconds since the Unix epoch.
    pub start_time_seconds: Gauge,
}

impl ShipperMetrics {
    /// Creates the metrics set with all collectors registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let published_events = Counter::with_opts(
            Opts::new(
                "published_events_total",
                "Total events published across all sources.",
            )
            .namespace("logship"),
        )?;
        let publish_failures = Counter::with_opts(
            Opts::new("publish_failures_total", "Total batch publish failures.")
                .namespace("logship"),
        )?;
        let published_by_source = CounterVec::new(
            Opts::new("published_events", "Events published by source.").namespace("logship"),
            &["source"],
        )?;
        let ignored_events = Counter::with_opts(
            Opts::new(
                "ignored_events_total",
                "Total events dropped by the ignore-older filter.",
            )
            .namespace("logship"),
        )?;
        let ignored_by_source = CounterVec::new(
            Opts::new("ignored_events", "Ignored events by source.").namespace("logship"),
            &["source"],
        )?;
        let acked_events = Counter::with_opts(
            Opts::new(
                "publish_acked_events_total",
                "Bulk items acknowledged by the index service.",
            )
            .namespace("logship"),
        )?;
        let not_acked_events = Counter::with_opts(
            Opts::new(
                "publish_not_acked_events_total",
                "Bulk items that received transient failure statuses.",
            )
            .namespace("logship"),
        )?;
        let publish_calls = Counter::with_opts(
            Opts::new(
                "publish_calls_total",
                "Total calls into the bulk publish path.",
            )
            .namespace("logship"),
        )?;
        let start_time_seconds = Gauge::with_opts(
            Opts::new(
                "start_time_seconds",
                "Process start time as seconds since the Unix epoch.",
            )
            .namespace("logship"),
        )?;

        registry.register(Box::new(published_events.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(published_by_source.clone()))?;
        registry.register(Box::new(ignored_events.clone()))?;
        registry.register(Box::new(ignored_by_source.clone()))?;
        registry.register(Box::new(acked_events.clone()))?;
        registry.register(Box::new(not_acked_events.clone()))?;
        registry.register(Box::new(publish_calls.clone()))?;
        registry.register(Box::new(start_time_seconds.clone()))?;

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        start_time_seconds.set(started);

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            published_events,
            publish_failures,
            published_by_source,
            ignored_events,
            ignored_by_source,
            acked_events,
            not_acked_events,
            publish_calls,
            start_time_seconds,
        })
    }

    /// Whether an HTTP endpoint is configured. When false, metrics remain
    /// in-process only.
    pub fn has_endpoint(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        // Accept the ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the metrics server, if running.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Gathers the registry into the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("metrics are not valid UTF-8")
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
