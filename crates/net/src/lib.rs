//! gRPC networking layer for ringkv.
//!
//! Provides:
//! - `GrpcPeerClient`, `GrpcControlPlane`, `GrpcNodeClient`: the kv and
//!   coordinator traits implemented over tonic
//! - `KvService`: bridges the client proto to `NodeServer::handle`
//! - `NodeControlService`: ring updates, write locks, heartbeats and item
//!   pushes on a node's control address
//! - `CoordinatorService`: bridges the coordinator proto to `Coordinator`
//! - router builders for each listening address

#![allow(clippy::result_large_err)]

pub mod client;
pub mod convert;
pub mod server;

pub use client::{ChannelPool, GrpcControlPlane, GrpcNodeClient, GrpcPeerClient};
pub use server::{CoordinatorService, KvService, NodeControlService};

use ringkv_coordinator::{Coordinator, NodeClient};
use ringkv_kv::{ControlPlane, NodeServer, PeerClient};
use std::sync::Arc;

/// A storage node wired to real gRPC peers and coordinator.
pub type GrpcNode = NodeServer<GrpcPeerClient, GrpcControlPlane>;

/// The coordinator wired to real gRPC nodes.
pub type GrpcCoordinator = Coordinator<GrpcNodeClient>;

/// Router for a node's data address (client traffic).
pub fn data_router<P: PeerClient, C: ControlPlane>(
    node: Arc<NodeServer<P, C>>,
) -> tonic::transport::server::Router {
    tonic::transport::Server::builder().add_service(
        ringkv_proto::kv::kv_service_server::KvServiceServer::new(KvService { node }),
    )
}

/// Router for a node's control address (coordinator and peer traffic).
pub fn control_router<P: PeerClient, C: ControlPlane>(
    node: Arc<NodeServer<P, C>>,
) -> tonic::transport::server::Router {
    tonic::transport::Server::builder().add_service(
        ringkv_proto::control::node_control_server::NodeControlServer::new(NodeControlService {
            node,
        }),
    )
}

/// Router for the coordinator.
pub fn coordinator_router<N: NodeClient>(
    coordinator: Arc<Coordinator<N>>,
) -> tonic::transport::server::Router {
    tonic::transport::Server::builder().add_service(
        ringkv_proto::coordinator::coordinator_service_server::CoordinatorServiceServer::new(
            CoordinatorService { coordinator },
        ),
    )
}
