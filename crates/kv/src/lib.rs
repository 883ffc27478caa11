//! Node-side KV layer on top of the hash ring and storage engine.
//!
//! Provides: request dispatch with ownership checks, per-peer replication
//! streams, and the handoff protocol that moves items when the ring changes.

pub mod chaos;
pub mod handoff;
pub mod peer;
pub mod replicator;
pub mod server;

pub use peer::{ControlPlane, PeerClient, PeerError, PushKind};
pub use server::{KvCommand, KvError, KvReply, NodeOptions, NodeServer};
