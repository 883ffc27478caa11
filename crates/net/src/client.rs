//! gRPC clients for the node and coordinator traits.
//!
//! - `GrpcPeerClient` implements `PeerClient` (node → node pushes).
//! - `GrpcControlPlane` implements `ControlPlane` (node → coordinator).
//! - `GrpcNodeClient` implements `NodeClient` (coordinator → node).
//!
//! All three share the same connection caching strategy: one tonic channel
//! per address, created on demand and dropped after a failed call so the
//! next call reconnects.

use crate::convert;
use ringkv_common::{FinishReply, Item, RingUpdate, ShutdownReply};
use ringkv_coordinator::{CoordinatorError, NodeClient};
use ringkv_kv::{ControlPlane, PeerClient, PeerError, PushKind};
use ringkv_proto::common as pb;
use ringkv_proto::control as pb_control;
use ringkv_proto::control::node_control_client::NodeControlClient;
use ringkv_proto::coordinator as pb_coord;
use ringkv_proto::coordinator::coordinator_service_client::CoordinatorServiceClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tonic::transport::{Channel, Endpoint};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Cached tonic channels keyed by `host:port`.
#[derive(Debug, Clone, Default)]
pub struct ChannelPool {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    request_timeout: Option<Duration>,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a per-request deadline to every channel the pool creates.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub async fn get(&self, addr: &str) -> Result<Channel, String> {
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(addr) {
                return Ok(channel.clone());
            }
        }

        let mut endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| format!("invalid endpoint {}: {}", addr, e))?
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| format!("connect to {} failed: {}", addr, e))?;

        self.channels
            .write()
            .await
            .insert(addr.to_string(), channel.clone());
        Ok(channel)
    }

    /// Remove a cached channel (e.g., on connection failure).
    pub async fn invalidate(&self, addr: &str) {
        self.channels.write().await.remove(addr);
    }
}

fn record_outbound(rpc: &str) -> prometheus::HistogramTimer {
    ringkv_metrics::start_rpc_timer(rpc, "outbound")
}

// ---------------------------------------------------------------------------
// Node → node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GrpcPeerClient {
    pool: ChannelPool,
}

impl GrpcPeerClient {
    pub fn new(pool: ChannelPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn push(
        &self,
        target_control: &str,
        item: &Item,
        kind: PushKind,
    ) -> Result<(), PeerError> {
        let _timer = record_outbound(kind.as_str());
        let channel = self
            .pool
            .get(target_control)
            .await
            .map_err(PeerError::RpcFailed)?;
        let mut client = NodeControlClient::new(channel);

        let request = pb_control::PushItemRequest {
            item: Some(convert::item_to_proto(item)),
            kind: convert::push_kind_to_proto(kind) as i32,
        };
        match client.push_item(request).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == tonic::Code::InvalidArgument => {
                Err(PeerError::Rejected(status.message().to_string()))
            }
            Err(status) => {
                self.pool.invalidate(target_control).await;
                Err(PeerError::RpcFailed(format!(
                    "push to {} failed: {}",
                    target_control, status
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node → coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrpcControlPlane {
    coordinator_addr: String,
    pool: ChannelPool,
}

impl GrpcControlPlane {
    pub fn new(coordinator_addr: impl Into<String>, pool: ChannelPool) -> Self {
        Self {
            coordinator_addr: coordinator_addr.into(),
            pool,
        }
    }

    async fn client(&self) -> Result<CoordinatorServiceClient<Channel>, PeerError> {
        let channel = self
            .pool
            .get(&self.coordinator_addr)
            .await
            .map_err(PeerError::RpcFailed)?;
        Ok(CoordinatorServiceClient::new(channel))
    }

    async fn fail(&self, rpc: &str, status: tonic::Status) -> PeerError {
        match status.code() {
            tonic::Code::NotFound => PeerError::UnknownNode(status.message().to_string()),
            tonic::Code::InvalidArgument => PeerError::Rejected(status.message().to_string()),
            tonic::Code::DeadlineExceeded => PeerError::Timeout,
            _ => {
                self.pool.invalidate(&self.coordinator_addr).await;
                PeerError::RpcFailed(format!("{} failed: {}", rpc, status))
            }
        }
    }
}

#[async_trait::async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn register(&self, data_addr: &str, control_addr: &str) -> Result<RingUpdate, PeerError> {
        let _timer = record_outbound("register");
        let request = pb_coord::RegisterRequest {
            data_addr: data_addr.to_string(),
            control_addr: control_addr.to_string(),
        };
        match self.client().await?.register(request).await {
            Ok(resp) => Ok(convert::ring_update_from_proto(resp.into_inner())),
            Err(status) => Err(self.fail("register", status).await),
        }
    }

    async fn resolve_control(&self, data_addr: &str) -> Result<String, PeerError> {
        let _timer = record_outbound("lookup_control");
        let request = pb_coord::LookupRequest {
            addr: data_addr.to_string(),
        };
        match self.client().await?.lookup_control(request).await {
            Ok(resp) => Ok(resp.into_inner().addr),
            Err(status) => Err(self.fail("lookup_control", status).await),
        }
    }

    async fn finish(&self, control_addr: &str) -> Result<FinishReply, PeerError> {
        let _timer = record_outbound("finish");
        let request = pb_coord::NodeRef {
            control_addr: control_addr.to_string(),
        };
        match self.client().await?.finish(request).await {
            Ok(resp) => Ok(convert::finish_from_proto(resp.into_inner())),
            Err(status) => Err(self.fail("finish", status).await),
        }
    }

    async fn shutdown(&self, control_addr: &str) -> Result<ShutdownReply, PeerError> {
        let _timer = record_outbound("shutdown");
        let request = pb_coord::NodeRef {
            control_addr: control_addr.to_string(),
        };
        match self.client().await?.shutdown(request).await {
            Ok(resp) => convert::shutdown_from_proto(resp.into_inner())
                .map_err(|s| PeerError::RpcFailed(s.message().to_string())),
            Err(status) => Err(self.fail("shutdown", status).await),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator → node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GrpcNodeClient {
    pool: ChannelPool,
}

impl GrpcNodeClient {
    pub fn new(pool: ChannelPool) -> Self {
        Self { pool }
    }

    async fn client(&self, control_addr: &str) -> Result<NodeControlClient<Channel>, CoordinatorError> {
        let channel = self
            .pool
            .get(control_addr)
            .await
            .map_err(CoordinatorError::Rpc)?;
        Ok(NodeControlClient::new(channel))
    }

    async fn fail(&self, control_addr: &str, rpc: &str, status: tonic::Status) -> CoordinatorError {
        self.pool.invalidate(control_addr).await;
        if status.code() == tonic::Code::DeadlineExceeded {
            CoordinatorError::Timeout
        } else {
            CoordinatorError::Rpc(format!("{} to {} failed: {}", rpc, control_addr, status))
        }
    }
}

#[async_trait::async_trait]
impl NodeClient for GrpcNodeClient {
    async fn send_ring(&self, control_addr: &str, update: &RingUpdate) -> Result<(), CoordinatorError> {
        let _timer = record_outbound("update_ring");
        let request = convert::ring_update_to_proto(update);
        match self.client(control_addr).await?.update_ring(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(self.fail(control_addr, "update_ring", status).await),
        }
    }

    async fn set_lock(&self, control_addr: &str, locked: bool) -> Result<(), CoordinatorError> {
        let _timer = record_outbound("set_write_lock");
        let request = pb_control::SetWriteLockRequest { locked };
        match self.client(control_addr).await?.set_write_lock(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(self.fail(control_addr, "set_write_lock", status).await),
        }
    }

    async fn heartbeat(&self, control_addr: &str) -> Result<(), CoordinatorError> {
        let _timer = record_outbound("heartbeat");
        match self.client(control_addr).await?.heartbeat(pb::Empty {}).await {
            Ok(_) => Ok(()),
            Err(status) => Err(self.fail(control_addr, "heartbeat", status).await),
        }
    }
}
