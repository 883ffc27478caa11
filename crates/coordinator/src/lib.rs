//! Ring coordinator.
//!
//! Holds the authoritative [`Membership`] and drives the rebalancing
//! protocol: it write-locks nodes whose range shrinks, hands leaving nodes
//! the ring they must migrate to, releases locks once handoff finishes and
//! rebroadcasts the latest ring. A heartbeat task removes nodes that stop
//! answering.
//!
//! State changes happen under a single async mutex; messages to nodes are
//! sent after it is released, through the [`NodeClient`] trait.

pub mod membership;

pub use membership::{JoinOutcome, Membership};

use ringkv_common::{FinishReply, RingUpdate, ShutdownReply};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("RPC failed: {0}")]
    Rpc(String),
    #[error("timeout")]
    Timeout,
}

/// Coordinator-to-node calls, addressed by control address.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync + 'static {
    async fn send_ring(&self, control_addr: &str, update: &RingUpdate)
        -> Result<(), CoordinatorError>;

    async fn set_lock(&self, control_addr: &str, locked: bool) -> Result<(), CoordinatorError>;

    async fn heartbeat(&self, control_addr: &str) -> Result<(), CoordinatorError>;
}

pub struct Coordinator<N: NodeClient> {
    state: Mutex<Membership>,
    nodes: Arc<N>,
    heartbeat_timeout: Duration,
}

impl<N: NodeClient> std::fmt::Debug for Coordinator<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish_non_exhaustive()
    }
}

impl<N: NodeClient> Coordinator<N> {
    pub fn new(nodes: Arc<N>, heartbeat_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(Membership::new()),
            nodes,
            heartbeat_timeout,
        }
    }

    /// The current ring and its version.
    pub async fn current(&self) -> RingUpdate {
        self.state.lock().await.current()
    }

    /// `(data, control)` pairs of the ring members.
    pub async fn members(&self) -> Vec<(String, String)> {
        self.state.lock().await.members()
    }

    pub async fn lookup_control(&self, data_addr: &str) -> Result<String, CoordinatorError> {
        self.state
            .lock()
            .await
            .control_of(data_addr)
            .map(str::to_string)
            .ok_or_else(|| CoordinatorError::UnknownNode(data_addr.to_string()))
    }

    pub async fn lookup_data(&self, control_addr: &str) -> Result<String, CoordinatorError> {
        self.state
            .lock()
            .await
            .data_of(control_addr)
            .map(str::to_string)
            .ok_or_else(|| CoordinatorError::UnknownNode(control_addr.to_string()))
    }

    // -----------------------------------------------------------------------
    // Node requests
    // -----------------------------------------------------------------------

    /// Add a node and return the ring it should start from.
    ///
    /// The node whose range shrank is locked and sent the new ring before
    /// this returns; it reports back through [`finish`](Self::finish) once
    /// its handoff is done.
    pub async fn register(
        &self,
        data_addr: &str,
        control_addr: &str,
    ) -> Result<RingUpdate, CoordinatorError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let outcome = state.join(data_addr, control_addr)?;
            self.report(&state);
            outcome
        };
        tracing::info!(
            "registered {} (control {}); ring v{}",
            data_addr,
            control_addr,
            outcome.update.version
        );

        if let Some(shrinking) = &outcome.shrinking {
            tracing::info!("locking {} for handoff to {}", shrinking, data_addr);
            if let Err(e) = self.nodes.set_lock(shrinking, true).await {
                tracing::warn!("failed to lock {}: {}", shrinking, e);
            }
            if let Err(e) = self.nodes.send_ring(shrinking, &outcome.update).await {
                tracing::warn!("failed to send ring to {}: {}", shrinking, e);
            }
        }
        Ok(outcome.update)
    }

    /// A node finished its handoff. Releases its lock (or says goodbye if it
    /// has left) and rebroadcasts the latest ring to every member.
    pub async fn finish(&self, control_addr: &str) -> Result<FinishReply, CoordinatorError> {
        let (reply, update, members) = {
            let mut state = self.state.lock().await;
            let reply = state.finish(control_addr)?;
            (reply, state.current(), state.members())
        };
        tracing::info!("{} finished handoff: {:?}", control_addr, reply);

        self.broadcast(&update, &members).await;
        Ok(reply)
    }

    /// A node asks to leave. It is removed from the ring right away; the
    /// remaining members learn about it when the node calls `finish`.
    pub async fn shutdown(&self, control_addr: &str) -> Result<ShutdownReply, CoordinatorError> {
        let reply = {
            let mut state = self.state.lock().await;
            let reply = state.leave(control_addr)?;
            self.report(&state);
            reply
        };
        tracing::info!("{} is leaving the ring", control_addr);
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    /// Probe every member once. Nodes that fail or miss the timeout are
    /// removed and the new ring is broadcast. Returns the removed data
    /// addresses.
    pub async fn check_members(&self) -> Vec<String> {
        let members = self.members().await;

        let probes = members.iter().map(|(data, control)| async move {
            let ok = match tokio::time::timeout(
                self.heartbeat_timeout,
                self.nodes.heartbeat(control),
            )
            .await
            {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!("heartbeat to {} failed: {}", data, e);
                    false
                }
                Err(_) => {
                    tracing::warn!("heartbeat to {} timed out", data);
                    false
                }
            };
            (data.clone(), ok)
        });
        let failed: Vec<String> = futures::future::join_all(probes)
            .await
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(data, _)| data)
            .collect();
        if failed.is_empty() {
            return failed;
        }

        let m = ringkv_metrics::metrics();
        m.heartbeat_failures.inc_by(failed.len() as u64);

        let (update, members) = {
            let mut state = self.state.lock().await;
            for data in &failed {
                if state.remove_failed(data) {
                    tracing::warn!("removed unresponsive node {}", data);
                }
            }
            self.report(&state);
            (state.current(), state.members())
        };
        self.broadcast(&update, &members).await;
        failed
    }

    /// Spawn a background task that runs [`check_members`](Self::check_members)
    /// every `interval`.
    pub fn spawn_heartbeat_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let removed = coordinator.check_members().await;
                if !removed.is_empty() {
                    tracing::info!("heartbeat removed {} node(s)", removed.len());
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn broadcast(&self, update: &RingUpdate, members: &[(String, String)]) {
        let sends = members.iter().map(|(data, control)| async move {
            if let Err(e) = self.nodes.send_ring(control, update).await {
                tracing::warn!("failed to send ring v{} to {}: {}", update.version, data, e);
            }
        });
        futures::future::join_all(sends).await;
        tracing::debug!(
            "broadcast ring v{} to {} member(s)",
            update.version,
            members.len()
        );
    }

    fn report(&self, state: &Membership) {
        let m = ringkv_metrics::metrics();
        m.ring_version.set(state.version() as i64);
        m.ring_members.set(state.ring().len() as i64);
    }
}
