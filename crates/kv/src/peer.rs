//! Abstractions over the calls a storage node makes to other processes.
//!
//! Concrete gRPC implementations live in `ringkv-net::client`; tests use
//! in-memory implementations wired straight to other `NodeServer`s and the
//! coordinator.

use ringkv_common::{FinishReply, Item, RingUpdate, ShutdownReply};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("RPC failed: {0}")]
    RpcFailed(String),
    #[error("no control address known for {0}")]
    UnknownNode(String),
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error("timeout")]
    Timeout,
}

/// Why an item is being pushed to another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    /// Copy from the owner to one of its replicas.
    Replicate,
    /// Ownership transfer during handoff.
    Transfer,
}

impl PushKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replicate => "replicate",
            Self::Transfer => "transfer",
        }
    }
}

/// Node-to-node item pushes, addressed by control address.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn push(&self, target_control: &str, item: &Item, kind: PushKind)
        -> Result<(), PeerError>;
}

/// Node-to-coordinator calls.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Join the ring. Returns the ring the node should start from.
    async fn register(&self, data_addr: &str, control_addr: &str)
        -> Result<RingUpdate, PeerError>;

    /// Translate a data address into the node's control address.
    async fn resolve_control(&self, data_addr: &str) -> Result<String, PeerError>;

    /// Report that a handoff round has completed.
    async fn finish(&self, control_addr: &str) -> Result<FinishReply, PeerError>;

    /// Ask to leave the ring.
    async fn shutdown(&self, control_addr: &str) -> Result<ShutdownReply, PeerError>;
}
