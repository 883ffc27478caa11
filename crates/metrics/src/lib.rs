//! Metrics and tracing setup for ringkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.
//! Storage nodes and the coordinator share the same registry layout; each
//! process only moves the series it owns.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a ringkv process.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── RPCs ──
    pub rpcs_received_by_type: IntCounterVec,
    pub rpc_latency_secs: HistogramVec,

    // ── KV operations ──
    pub kv_ops: IntCounterVec,
    pub kv_rejections: IntCounterVec,
    pub kv_latency_secs: HistogramVec,

    // ── Replication ──
    pub replication_sent: IntCounter,
    pub replication_failed: IntCounter,
    pub replication_resyncs: IntCounter,
    pub replication_peers: IntGauge,

    // ── Handoff ──
    pub handoffs: IntCounter,
    pub handoff_items: IntCounter,

    // ── Storage ──
    pub storage_segments: IntGauge,
    pub memtable_bytes: IntGauge,

    // ── Ring / membership ──
    pub ring_updates: IntCounter,
    pub ring_version: IntGauge,
    pub ring_members: IntGauge,
    pub heartbeat_failures: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Default histogram buckets (seconds) for RPC/KV latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts")
}

fn histogram_vec(name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
        labels,
    )
    .expect("valid histogram opts")
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let m = Self {
            rpcs_received_by_type: counter_vec(
                "ringkv_rpcs_received_total",
                "Inbound RPCs received, by type",
                &["rpc_type"],
            ),
            rpc_latency_secs: histogram_vec(
                "ringkv_rpc_latency_seconds",
                "RPC latency in seconds",
                &["rpc_type", "direction"],
            ),
            kv_ops: counter_vec(
                "ringkv_kv_ops_total",
                "Client KV operations handled, by op",
                &["op"],
            ),
            kv_rejections: counter_vec(
                "ringkv_kv_rejections_total",
                "Client KV operations rejected, by reason",
                &["reason"],
            ),
            kv_latency_secs: histogram_vec(
                "ringkv_kv_latency_seconds",
                "KV operation latency in seconds",
                &["op_type"],
            ),
            replication_sent: counter(
                "ringkv_replication_sent_total",
                "Items pushed to replica peers",
            ),
            replication_failed: counter(
                "ringkv_replication_failed_total",
                "Replica pushes that failed",
            ),
            replication_resyncs: counter(
                "ringkv_replication_resyncs_total",
                "Full resyncs started towards new replica peers",
            ),
            replication_peers: gauge(
                "ringkv_replication_peers",
                "Current number of replica peers",
            ),
            handoffs: counter("ringkv_handoffs_total", "Handoff rounds started"),
            handoff_items: counter(
                "ringkv_handoff_items_total",
                "Items transferred to new owners during handoff",
            ),
            storage_segments: gauge("ringkv_storage_segments", "Segments on disk"),
            memtable_bytes: gauge(
                "ringkv_memtable_bytes",
                "Approximate size of the active memtable",
            ),
            ring_updates: counter("ringkv_ring_updates_total", "Ring versions applied"),
            ring_version: gauge("ringkv_ring_version", "Current ring version"),
            ring_members: gauge("ringkv_ring_members", "Nodes in the current ring"),
            heartbeat_failures: counter(
                "ringkv_heartbeat_failures_total",
                "Heartbeat probes that failed or timed out",
            ),
            registry,
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(m.rpcs_received_by_type.clone()),
            Box::new(m.rpc_latency_secs.clone()),
            Box::new(m.kv_ops.clone()),
            Box::new(m.kv_rejections.clone()),
            Box::new(m.kv_latency_secs.clone()),
            Box::new(m.replication_sent.clone()),
            Box::new(m.replication_failed.clone()),
            Box::new(m.replication_resyncs.clone()),
            Box::new(m.replication_peers.clone()),
            Box::new(m.handoffs.clone()),
            Box::new(m.handoff_items.clone()),
            Box::new(m.storage_segments.clone()),
            Box::new(m.memtable_bytes.clone()),
            Box::new(m.ring_updates.clone()),
            Box::new(m.ring_version.clone()),
            Box::new(m.ring_members.clone()),
            Box::new(m.heartbeat_failures.clone()),
        ];
        for collector in collectors {
            m.registry
                .register(collector)
                .expect("metric registered once");
        }

        m
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start an RPC latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_rpc_timer(rpc_type: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[rpc_type, direction])
        .start_timer()
}

/// Helper: start a KV operation latency timer.
pub fn start_kv_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = if req.uri().path() == "/metrics" {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(encode_metrics())))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")))
    };
    Ok(response.expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// This spawns a lightweight HTTP/1.1 server. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
