use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "epochroll";

/// Prometheus metrics for the exporter.
///
/// All metrics use the "epochroll" namespace. Grouped by concern:
/// - Loops: cycle outcomes and per-stage latency of every pipeline
/// - Ingest: safe/inserted frontiers and committed epochs
/// - Storage: partition lifecycle and fixed-grain progress
/// - Rolling: window bounds, lag and bootstraps per table
/// - Upstreams: beacon node and archive calls
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Loops ===
    /// Loop iterations by pipeline and result (ok/not_ready/invariant/error).
    pub cycles_total: CounterVec,
    /// Duration of each pipeline stage.
    pub stage_duration: HistogramVec,

    // === Ingest ===
    /// Latest finalized epoch reported by the source.
    pub safe_epoch: Gauge,
    /// Highest durably inserted epoch.
    pub latest_inserted: Gauge,
    /// Epoch the wall clock is currently in.
    pub wallclock_epoch: Gauge,
    /// Epochs committed by pipeline.
    pub epochs_committed: CounterVec,
    /// Batches committed by pipeline.
    pub batches_committed: CounterVec,

    // === Storage ===
    /// Partitions created by level.
    pub partitions_created: CounterVec,
    /// Partitions dropped by retention, by level.
    pub partitions_dropped: CounterVec,
    /// Buckets written (complete or partial) by level.
    pub buckets_written: CounterVec,
    /// Highest epoch covered by contiguous buckets, by level.
    pub bucket_frontier: GaugeVec,

    // === Rolling ===
    /// First epoch of each rolling window.
    pub rolling_start: GaugeVec,
    /// Exclusive end epoch of each rolling window.
    pub rolling_end: GaugeVec,
    /// Epochs the window trails the inserted head by.
    pub rolling_lag: GaugeVec,
    /// Full rebuilds per rolling table.
    pub rolling_bootstraps: CounterVec,

    // === Upstreams ===
    /// Beacon API requests by endpoint and status.
    pub beacon_requests_total: CounterVec,
    /// Beacon request duration by endpoint.
    pub beacon_request_duration: HistogramVec,
    /// Rows appended to the archive.
    pub archive_rows: Counter,
    /// Archive append duration.
    pub archive_write_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Loops ===
        let cycles_total = CounterVec::new(
            Opts::new("cycles_total", "Loop iterations by pipeline and result.")
                .namespace(NAMESPACE),
            &["pipeline", "result"],
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new("stage_duration_seconds", "Duration of each pipeline stage.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ]),
            &["pipeline", "stage"],
        )?;

        // === Ingest ===
        let safe_epoch = Gauge::with_opts(
            Opts::new("safe_epoch", "Latest finalized epoch reported by the source.")
                .namespace(NAMESPACE),
        )?;
        let latest_inserted = Gauge::with_opts(
            Opts::new("latest_inserted_epoch", "Highest durably inserted epoch.")
                .namespace(NAMESPACE),
        )?;
        let wallclock_epoch = Gauge::with_opts(
            Opts::new("wallclock_epoch", "Epoch the wall clock is currently in.")
                .namespace(NAMESPACE),
        )?;
        let epochs_committed = CounterVec::new(
            Opts::new("epochs_committed_total", "Epochs committed by pipeline.")
                .namespace(NAMESPACE),
            &["pipeline"],
        )?;
        let batches_committed = CounterVec::new(
            Opts::new("batches_committed_total", "Batches committed by pipeline.")
                .namespace(NAMESPACE),
            &["pipeline"],
        )?;

        // === Storage ===
        let partitions_created = CounterVec::new(
            Opts::new("partitions_created_total", "Partitions created by level.")
                .namespace(NAMESPACE),
            &["level"],
        )?;
        let partitions_dropped = CounterVec::new(
            Opts::new(
                "partitions_dropped_total",
                "Partitions dropped by retention, by level.",
            )
            .namespace(NAMESPACE),
            &["level"],
        )?;
        let buckets_written = CounterVec::new(
            Opts::new("buckets_written_total", "Buckets written by level.").namespace(NAMESPACE),
            &["level"],
        )?;
        let bucket_frontier = GaugeVec::new(
            Opts::new(
                "bucket_frontier_epoch",
                "Highest epoch covered by contiguous buckets.",
            )
            .namespace(NAMESPACE),
            &["level"],
        )?;

        // === Rolling ===
        let rolling_start = GaugeVec::new(
            Opts::new("rolling_start_epoch", "First epoch of each rolling window.")
                .namespace(NAMESPACE),
            &["table"],
        )?;
        let rolling_end = GaugeVec::new(
            Opts::new(
                "rolling_end_epoch",
                "Exclusive end epoch of each rolling window.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let rolling_lag = GaugeVec::new(
            Opts::new(
                "rolling_lag_epochs",
                "Epochs the window trails the inserted head by.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let rolling_bootstraps = CounterVec::new(
            Opts::new("rolling_bootstraps_total", "Full rebuilds per rolling table.")
                .namespace(NAMESPACE),
            &["table"],
        )?;

        // === Upstreams ===
        let beacon_requests_total = CounterVec::new(
            Opts::new(
                "beacon_requests_total",
                "Beacon API requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let beacon_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "beacon_request_duration_seconds",
                "Beacon request duration by endpoint.",
            )
            .namespace(NAMESPACE),
            &["endpoint"],
        )?;
        let archive_rows = Counter::with_opts(
            Opts::new("archive_rows_total", "Rows appended to the archive.").namespace(NAMESPACE),
        )?;
        let archive_write_duration = Histogram::with_opts(
            HistogramOpts::new("archive_write_duration_seconds", "Archive append duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;

        registry.register(Box::new(safe_epoch.clone()))?;
        registry.register(Box::new(latest_inserted.clone()))?;
        registry.register(Box::new(wallclock_epoch.clone()))?;
        registry.register(Box::new(epochs_committed.clone()))?;
        registry.register(Box::new(batches_committed.clone()))?;

        registry.register(Box::new(partitions_created.clone()))?;
        registry.register(Box::new(partitions_dropped.clone()))?;
        registry.register(Box::new(buckets_written.clone()))?;
        registry.register(Box::new(bucket_frontier.clone()))?;

        registry.register(Box::new(rolling_start.clone()))?;
        registry.register(Box::new(rolling_end.clone()))?;
        registry.register(Box::new(rolling_lag.clone()))?;
        registry.register(Box::new(rolling_bootstraps.clone()))?;

        registry.register(Box::new(beacon_requests_total.clone()))?;
        registry.register(Box::new(beacon_request_duration.clone()))?;
        registry.register(Box::new(archive_rows.clone()))?;
        registry.register(Box::new(archive_write_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles_total,
            stage_duration,
            safe_epoch,
            latest_inserted,
            wallclock_epoch,
            epochs_committed,
            batches_committed,
            partitions_created,
            partitions_dropped,
            buckets_written,
            bucket_frontier,
            rolling_start,
            rolling_end,
            rolling_lag,
            rolling_bootstraps,
            beacon_requests_total,
            beacon_request_duration,
            archive_rows,
            archive_write_duration,
        })
    }

    /// Records the time since `started` for one pipeline stage.
    pub fn observe_stage(&self, pipeline: &str, stage: &str, started: Instant) {
        self.stage_duration
            .with_label_values(&[pipeline, stage])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Counts a committed batch of `epochs` epochs.
    pub fn record_commit(&self, pipeline: &str, epochs: usize) {
        self.batches_committed.with_label_values(&[pipeline]).inc();
        self.epochs_committed
            .with_label_values(&[pipeline])
            .inc_by(epochs as f64);
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
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
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
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

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
