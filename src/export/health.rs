use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "stats_collector";

/// Prometheus metrics describing the collector's own behaviour.
///
/// All metrics use the "stats_collector" namespace. The registry is shared
/// with the metrics sink so collected stats appear on the same endpoint.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    /// Completed poll ticks.
    pub ticks: Counter,
    /// Wall time of a full tick across all kinds.
    pub tick_duration: Histogram,
    /// Failed snapshot fetches by kind.
    pub fetch_errors: CounterVec,
    /// Failed batch writes by kind.
    pub sink_errors: CounterVec,
    /// Rows handed to the sink by kind.
    pub rows_emitted: CounterVec,
    /// Rows skipped as undecodable by kind.
    pub rows_malformed: CounterVec,
    /// Current watermark as unix seconds by kind.
    pub watermark: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let ticks = Counter::with_opts(
            Opts::new("ticks_total", "Total completed poll ticks.").namespace(NAMESPACE),
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tick_duration_seconds",
                "Time to fetch, filter and deliver all kinds in one tick.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )?;
        let fetch_errors = CounterVec::new(
            Opts::new("fetch_errors_total", "Total failed snapshot fetches by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let sink_errors = CounterVec::new(
            Opts::new("sink_errors_total", "Total failed sink writes by kind.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_emitted = CounterVec::new(
            Opts::new(
                "rows_emitted_total",
                "Total rows delivered to the sink by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_malformed = CounterVec::new(
            Opts::new(
                "rows_malformed_total",
                "Total rows skipped because they could not be decoded.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let watermark = GaugeVec::new(
            Opts::new(
                "watermark_timestamp_seconds",
                "Latest interval end delivered per kind, as unix seconds.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(fetch_errors.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(rows_emitted.clone()))?;
        registry.register(Box::new(rows_malformed.clone()))?;
        registry.register(Box::new(watermark.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            ticks,
            tick_duration,
            fetch_errors,
            sink_errors,
            rows_emitted,
            rows_malformed,
            watermark,
        })
    }

    /// Registry served on /metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
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
