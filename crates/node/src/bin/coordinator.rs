//! ringkv-coordinator: membership authority for a ringkv cluster.
//!
//! Serves registration, finish, shutdown and lookup RPCs, and probes every
//! member on a fixed interval.

use ringkv_coordinator::Coordinator;
use ringkv_net::{ChannelPool, GrpcNodeClient};
use std::sync::Arc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ringkv_metrics::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coordinator.yaml".to_string());

    let config =
        ringkv_config::load_coordinator_config_from_file(std::path::Path::new(&config_path))
            .unwrap_or_else(|e| {
                tracing::warn!(
                    "failed to load config from {}: {}, using defaults",
                    config_path,
                    e
                );
                ringkv_config::load_coordinator_config_from_str("listen: \"127.0.0.1:6000\"\n")
                    .expect("hardcoded default config must parse")
            });

    let pool = ChannelPool::new().with_request_timeout(Duration::from_millis(config.rpc_timeout_ms));
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(GrpcNodeClient::new(pool)),
        Duration::from_millis(config.heartbeat_timeout_ms),
    ));
    coordinator.spawn_heartbeat_task(Duration::from_millis(config.heartbeat_interval_ms));

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

    let router = ringkv_net::coordinator_router(coordinator);
    tracing::info!("coordinator serving on {}", config.listen);
    tokio::select! {
        result = router.serve(config.listen) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
