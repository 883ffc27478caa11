//! gRPC service implementations.
//!
//! Bridges tonic-generated service traits to the domain logic in the `kv`
//! and `coordinator` crates.

use crate::convert;
use ringkv_coordinator::{Coordinator, CoordinatorError, NodeClient};
use ringkv_kv::{ControlPlane, KvError, NodeServer, PeerClient};
use ringkv_proto::common as pb;
use ringkv_proto::control as pb_control;
use ringkv_proto::coordinator as pb_coord;
use ringkv_proto::kv as pb_kv;
use std::sync::Arc;

fn record_inbound(rpc: &str) -> prometheus::HistogramTimer {
    ringkv_metrics::metrics()
        .rpcs_received_by_type
        .with_label_values(&[rpc])
        .inc();
    ringkv_metrics::start_rpc_timer(rpc, "inbound")
}

pub fn status_from_kv(e: KvError) -> tonic::Status {
    match e {
        KvError::Validation(e) => tonic::Status::invalid_argument(e.to_string()),
        KvError::Ring(e) => tonic::Status::invalid_argument(e.to_string()),
        KvError::Stopped => tonic::Status::unavailable("server stopped"),
        KvError::Peer(e) => tonic::Status::unavailable(e.to_string()),
        KvError::Storage(e) => tonic::Status::internal(e.to_string()),
    }
}

pub fn status_from_coordinator(e: CoordinatorError) -> tonic::Status {
    match e {
        CoordinatorError::UnknownNode(addr) => {
            tonic::Status::not_found(format!("unknown node: {}", addr))
        }
        CoordinatorError::InvalidAddress(addr) => {
            tonic::Status::invalid_argument(format!("invalid address: {:?}", addr))
        }
        CoordinatorError::Rpc(msg) => tonic::Status::unavailable(msg),
        CoordinatorError::Timeout => tonic::Status::deadline_exceeded("timeout"),
    }
}

// ---------------------------------------------------------------------------
// KV gRPC service (data address)
// ---------------------------------------------------------------------------

pub struct KvService<P: PeerClient, C: ControlPlane> {
    pub node: Arc<NodeServer<P, C>>,
}

impl<P: PeerClient, C: ControlPlane> std::fmt::Debug for KvService<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvService").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<P: PeerClient, C: ControlPlane> pb_kv::kv_service_server::KvService for KvService<P, C> {
    async fn execute(
        &self,
        request: tonic::Request<pb_kv::Command>,
    ) -> Result<tonic::Response<pb_kv::Reply>, tonic::Status> {
        let cmd = convert::command_from_proto(request.into_inner())?;
        tracing::debug!("{}: {}", self.node.data_addr(), cmd.name());
        let reply = self.node.handle(cmd);
        Ok(tonic::Response::new(convert::reply_to_proto(reply)))
    }
}

// ---------------------------------------------------------------------------
// Node control service (control address)
// ---------------------------------------------------------------------------

pub struct NodeControlService<P: PeerClient, C: ControlPlane> {
    pub node: Arc<NodeServer<P, C>>,
}

impl<P: PeerClient, C: ControlPlane> std::fmt::Debug for NodeControlService<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeControlService").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<P: PeerClient, C: ControlPlane> pb_control::node_control_server::NodeControl
    for NodeControlService<P, C>
{
    async fn update_ring(
        &self,
        request: tonic::Request<pb::RingUpdate>,
    ) -> Result<tonic::Response<pb::Empty>, tonic::Status> {
        let _timer = record_inbound("update_ring");
        let update = convert::ring_update_from_proto(request.into_inner());
        self.node
            .update_ring(update)
            .await
            .map_err(status_from_kv)?;
        Ok(tonic::Response::new(pb::Empty {}))
    }

    async fn set_write_lock(
        &self,
        request: tonic::Request<pb_control::SetWriteLockRequest>,
    ) -> Result<tonic::Response<pb::Empty>, tonic::Status> {
        let _timer = record_inbound("set_write_lock");
        self.node.set_write_lock(request.into_inner().locked);
        Ok(tonic::Response::new(pb::Empty {}))
    }

    async fn heartbeat(
        &self,
        _request: tonic::Request<pb::Empty>,
    ) -> Result<tonic::Response<pb_control::HeartbeatResponse>, tonic::Status> {
        let _timer = record_inbound("heartbeat");
        Ok(tonic::Response::new(pb_control::HeartbeatResponse {
            status: self.node.status().to_string(),
            ring_version: self.node.ring().version,
        }))
    }

    async fn push_item(
        &self,
        request: tonic::Request<pb_control::PushItemRequest>,
    ) -> Result<tonic::Response<pb::Empty>, tonic::Status> {
        let _timer = record_inbound("push_item");
        let req = request.into_inner();
        let kind = convert::push_kind_from_proto(req.kind)?;
        let item = req
            .item
            .map(convert::item_from_proto)
            .ok_or_else(|| tonic::Status::invalid_argument("missing item"))?;

        self.node
            .receive_push(item, kind)
            .map_err(status_from_kv)?;
        Ok(tonic::Response::new(pb::Empty {}))
    }
}

// ---------------------------------------------------------------------------
// Coordinator service
// ---------------------------------------------------------------------------

pub struct CoordinatorService<N: NodeClient> {
    pub coordinator: Arc<Coordinator<N>>,
}

impl<N: NodeClient> std::fmt::Debug for CoordinatorService<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorService").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<N: NodeClient> pb_coord::coordinator_service_server::CoordinatorService
    for CoordinatorService<N>
{
    async fn register(
        &self,
        request: tonic::Request<pb_coord::RegisterRequest>,
    ) -> Result<tonic::Response<pb::RingUpdate>, tonic::Status> {
        let _timer = record_inbound("register");
        let req = request.into_inner();
        let update = self
            .coordinator
            .register(&req.data_addr, &req.control_addr)
            .await
            .map_err(status_from_coordinator)?;
        Ok(tonic::Response::new(convert::ring_update_to_proto(&update)))
    }

    async fn finish(
        &self,
        request: tonic::Request<pb_coord::NodeRef>,
    ) -> Result<tonic::Response<pb_coord::FinishResponse>, tonic::Status> {
        let _timer = record_inbound("finish");
        let reply = self
            .coordinator
            .finish(&request.into_inner().control_addr)
            .await
            .map_err(status_from_coordinator)?;
        Ok(tonic::Response::new(convert::finish_to_proto(reply)))
    }

    async fn shutdown(
        &self,
        request: tonic::Request<pb_coord::NodeRef>,
    ) -> Result<tonic::Response<pb_coord::ShutdownResponse>, tonic::Status> {
        let _timer = record_inbound("shutdown");
        let reply = self
            .coordinator
            .shutdown(&request.into_inner().control_addr)
            .await
            .map_err(status_from_coordinator)?;
        Ok(tonic::Response::new(convert::shutdown_to_proto(reply)))
    }

    async fn lookup_control(
        &self,
        request: tonic::Request<pb_coord::LookupRequest>,
    ) -> Result<tonic::Response<pb_coord::LookupResponse>, tonic::Status> {
        let _timer = record_inbound("lookup_control");
        let addr = self
            .coordinator
            .lookup_control(&request.into_inner().addr)
            .await
            .map_err(status_from_coordinator)?;
        Ok(tonic::Response::new(pb_coord::LookupResponse { addr }))
    }

    async fn lookup_data(
        &self,
        request: tonic::Request<pb_coord::LookupRequest>,
    ) -> Result<tonic::Response<pb_coord::LookupResponse>, tonic::Status> {
        let _timer = record_inbound("lookup_data");
        let addr = self
            .coordinator
            .lookup_data(&request.into_inner().addr)
            .await
            .map_err(status_from_coordinator)?;
        Ok(tonic::Response::new(pb_coord::LookupResponse { addr }))
    }

    async fn current_ring(
        &self,
        _request: tonic::Request<pb::Empty>,
    ) -> Result<tonic::Response<pb::RingUpdate>, tonic::Status> {
        let update = self.coordinator.current().await;
        Ok(tonic::Response::new(convert::ring_update_to_proto(&update)))
    }
}
