//! ringkv-node: entry point for a storage node.
//!
//! Loads config, opens the storage engine, serves the data and control
//! addresses, registers with the coordinator, and leaves the ring
//! gracefully on Ctrl+C.

use ringkv_kv::{NodeOptions, NodeServer};
use ringkv_net::{ChannelPool, GrpcControlPlane, GrpcPeerClient};
use ringkv_storage::{FsyncPolicy, StorageEngine, StorageOptions};
use std::sync::Arc;
use tokio::time::Duration;

const STORAGE_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ringkv_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "node.yaml".to_string());

    let config = ringkv_config::load_node_config_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            ringkv_config::load_node_config_from_str(
                "data_addr: \"127.0.0.1:7000\"\ncontrol_addr: \"127.0.0.1:7001\"\n",
            )
            .expect("hardcoded default config must parse")
        });

    let storage = StorageEngine::open(
        &config.storage.data_dir,
        StorageOptions {
            fsync: FsyncPolicy::from_str_config(&config.storage.fsync),
            flush_threshold_bytes: config.storage.flush_threshold_bytes,
            flush_interval: Duration::from_millis(config.storage.flush_interval_ms),
        },
    )?;
    tracing::info!(
        "storage opened at {} ({} segment(s))",
        config.storage.data_dir.display(),
        storage.stats().segments
    );

    let mut options = NodeOptions::new(
        config.data_addr.to_string(),
        config.control_addr.to_string(),
    );
    options.replication_factor = config.replication.factor;
    options.handoff_concurrency = config.replication.handoff_concurrency;
    options.replica_stop_timeout = Duration::from_millis(config.replication.stop_timeout_ms);

    // Peers and the coordinator share one channel pool
    let pool = ChannelPool::new().with_request_timeout(Duration::from_millis(config.rpc_timeout_ms));
    let node = Arc::new(NodeServer::new(
        options,
        Arc::new(storage),
        Arc::new(GrpcPeerClient::new(pool.clone())),
        Arc::new(GrpcControlPlane::new(config.coordinator.clone(), pool)),
    ));

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr: std::net::SocketAddr = format!("0.0.0.0:{}", metrics_port)
            .parse()
            .expect("valid metrics address");
        tokio::spawn(async move {
            if let Err(e) = ringkv_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let reporter = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORAGE_REPORT_INTERVAL);
        loop {
            interval.tick().await;
            reporter.report_storage_metrics();
        }
    });

    // The control address must be up before registering: the coordinator
    // may lock a peer and push ring updates as soon as we join.
    let data_router = ringkv_net::data_router(node.clone());
    let control_router = ringkv_net::control_router(node.clone());
    let mut data_server = tokio::spawn(data_router.serve(config.data_addr));
    let mut control_server = tokio::spawn(control_router.serve(config.control_addr));
    tracing::info!(
        "serving data on {}, control on {}",
        config.data_addr,
        config.control_addr
    );

    node.join().await?;
    tracing::info!(
        "joined ring version {} via coordinator {}",
        node.ring().version,
        config.coordinator
    );

    tokio::select! {
        result = &mut data_server => {
            result??;
        }
        result = &mut control_server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, leaving the ring");
            if let Err(e) = node.leave().await {
                tracing::warn!("graceful leave failed: {}", e);
            }
            node.storage().sync()?;
        }
    }

    Ok(())
}
