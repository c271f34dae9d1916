use std::net::SocketAddr;
use std::sync::Arc;

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

use crate::config::expand_listen_addr;

const NAMESPACE: &str = "leakwatch";

/// Prometheus metrics for agent and collector health.
///
/// Both binaries register the full set under the "leakwatch" namespace;
/// each only moves the metrics of its own half.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Agent ===
    /// Sampling ticks executed.
    pub ticks: Counter,
    /// Tick duration from snapshot to send completion.
    pub tick_duration: Histogram,
    /// Reports written to the collector connection.
    pub reports_sent: Counter,
    /// Heartbeats emitted for empty ticks.
    pub heartbeats: Counter,
    /// Batches dropped because the write failed.
    pub send_failures: Counter,
    /// Collector dial attempts.
    pub connect_attempts: Counter,
    /// Collector dial failures.
    pub connect_failures: Counter,
    /// Whether the collector connection is up (1=yes, 0=no).
    pub collector_connected: Gauge,
    /// Accumulator snapshots that failed.
    pub snapshot_errors: Counter,
    /// Accumulator keys that could not be removed after a snapshot.
    pub map_delete_failures: Counter,
    /// Processes in the last snapshot.
    pub tracked_processes: Gauge,
    /// Leak suspects in the last snapshot.
    pub leak_suspects: Gauge,
    /// Tracepoint attachment state by probe (1=attached).
    pub probes_attached: GaugeVec,

    // === Collector ===
    /// Sessions accepted.
    pub sessions_accepted: Counter,
    /// Sessions currently open.
    pub sessions_active: Gauge,
    /// Accept errors.
    pub accept_errors: Counter,
    /// Reports decoded from sessions.
    pub records_received: Counter,
    /// Reports dropped before queueing (missing SystemId).
    pub records_rejected: Counter,
    /// Undecodable lines by reason.
    pub decode_errors: CounterVec,
    /// Reports waiting in the ingest queue.
    pub queue_depth: Gauge,
    /// Ingest queue capacity.
    pub queue_capacity: Gauge,
    /// Reports fully persisted (record and latest snapshot).
    pub records_persisted: Counter,
    /// Store write failures by document kind.
    pub store_write_errors: CounterVec,
    /// Store write latency by document kind.
    pub store_write_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Agent ===
        let ticks = Counter::with_opts(
            Opts::new("agent_ticks_total", "Sampling ticks executed.").namespace(NAMESPACE),
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_tick_duration_seconds",
                "Tick duration from snapshot to send completion.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let reports_sent = Counter::with_opts(
            Opts::new(
                "agent_reports_sent_total",
                "Reports written to the collector connection.",
            )
            .namespace(NAMESPACE),
        )?;
        let heartbeats = Counter::with_opts(
            Opts::new("agent_heartbeats_total", "Heartbeats emitted for empty ticks.")
                .namespace(NAMESPACE),
        )?;
        let send_failures = Counter::with_opts(
            Opts::new(
                "agent_send_failures_total",
                "Batches dropped because the write failed.",
            )
            .namespace(NAMESPACE),
        )?;
        let connect_attempts = Counter::with_opts(
            Opts::new("agent_connect_attempts_total", "Collector dial attempts.")
                .namespace(NAMESPACE),
        )?;
        let connect_failures = Counter::with_opts(
            Opts::new("agent_connect_failures_total", "Collector dial failures.")
                .namespace(NAMESPACE),
        )?;
        let collector_connected = Gauge::with_opts(
            Opts::new(
                "agent_collector_connected",
                "Whether the collector connection is up (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshot_errors = Counter::with_opts(
            Opts::new(
                "agent_snapshot_errors_total",
                "Accumulator snapshots that failed.",
            )
            .namespace(NAMESPACE),
        )?;
        let map_delete_failures = Counter::with_opts(
            Opts::new(
                "agent_map_delete_failures_total",
                "Accumulator keys that could not be removed after a snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let tracked_processes = Gauge::with_opts(
            Opts::new("agent_tracked_processes", "Processes in the last snapshot.")
                .namespace(NAMESPACE),
        )?;
        let leak_suspects = Gauge::with_opts(
            Opts::new("agent_leak_suspects", "Leak suspects in the last snapshot.")
                .namespace(NAMESPACE),
        )?;
        let probes_attached = GaugeVec::new(
            Opts::new(
                "agent_probes_attached",
                "Tracepoint attachment state by probe (1=attached).",
            )
            .namespace(NAMESPACE),
            &["probe"],
        )?;

        // === Collector ===
        let sessions_accepted = Counter::with_opts(
            Opts::new("collector_sessions_accepted_total", "Sessions accepted.")
                .namespace(NAMESPACE),
        )?;
        let sessions_active = Gauge::with_opts(
            Opts::new("collector_sessions_active", "Sessions currently open.")
                .namespace(NAMESPACE),
        )?;
        let accept_errors = Counter::with_opts(
            Opts::new("collector_accept_errors_total", "Accept errors.").namespace(NAMESPACE),
        )?;
        let records_received = Counter::with_opts(
            Opts::new(
                "collector_records_received_total",
                "Reports decoded from sessions.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_rejected = Counter::with_opts(
            Opts::new(
                "collector_records_rejected_total",
                "Reports dropped before queueing.",
            )
            .namespace(NAMESPACE),
        )?;
        let decode_errors = CounterVec::new(
            Opts::new(
                "collector_decode_errors_total",
                "Undecodable lines by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new(
                "collector_queue_depth",
                "Reports waiting in the ingest queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let queue_capacity = Gauge::with_opts(
            Opts::new("collector_queue_capacity", "Ingest queue capacity.").namespace(NAMESPACE),
        )?;
        let records_persisted = Counter::with_opts(
            Opts::new(
                "collector_records_persisted_total",
                "Reports fully persisted.",
            )
            .namespace(NAMESPACE),
        )?;
        let store_write_errors = CounterVec::new(
            Opts::new(
                "collector_store_write_errors_total",
                "Store write failures by document kind.",
            )
            .namespace(NAMESPACE),
            &["document"],
        )?;
        let store_write_duration = HistogramVec::new(
            HistogramOpts::new(
                "collector_store_write_duration_seconds",
                "Store write latency by document kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0]),
            &["document"],
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(reports_sent.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(connect_attempts.clone()))?;
        registry.register(Box::new(connect_failures.clone()))?;
        registry.register(Box::new(collector_connected.clone()))?;
        registry.register(Box::new(snapshot_errors.clone()))?;
        registry.register(Box::new(map_delete_failures.clone()))?;
        registry.register(Box::new(tracked_processes.clone()))?;
        registry.register(Box::new(leak_suspects.clone()))?;
        registry.register(Box::new(probes_attached.clone()))?;

        registry.register(Box::new(sessions_accepted.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(accept_errors.clone()))?;
        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_capacity.clone()))?;
        registry.register(Box::new(records_persisted.clone()))?;
        registry.register(Box::new(store_write_errors.clone()))?;
        registry.register(Box::new(store_write_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ticks,
            tick_duration,
            reports_sent,
            heartbeats,
            send_failures,
            connect_attempts,
            connect_failures,
            collector_connected,
            snapshot_errors,
            map_delete_failures,
            tracked_processes,
            leak_suspects,
            probes_attached,
            sessions_accepted,
            sessions_active,
            accept_errors,
            records_received,
            records_rejected,
            decode_errors,
            queue_depth,
            queue_capacity,
            records_persisted,
            store_write_errors,
            store_write_duration,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };
        let bind_addr = expand_listen_addr(addr);

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

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn render_registry(registry: &Registry) -> Result<String> {
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
    match render_registry(&state.registry) {
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
