//! Storage node: request dispatch, ring application and handoff driving.
//!
//! [`NodeServer`] owns the node's storage engine, its view of the ring, its
//! lifecycle status and its replicator. Client commands arrive as a
//! [`KvCommand`] and are answered with a [`KvReply`] by a single dispatcher;
//! the transport layer only translates to and from the wire.
//!
//! Lifecycle:
//! - `Bootstrapping` until the first ring arrives, then `Active`.
//! - `Balancing` while the coordinator holds a write lock on the node.
//! - `Shutdown` after the coordinator says goodbye.
//!
//! Generic over `P: PeerClient` and `C: ControlPlane` for testability; real
//! deployment uses the gRPC clients from `ringkv-net`.

use crate::handoff::{self, HandoffPlan, HandoffReport};
use crate::peer::{ControlPlane, PeerClient, PeerError, PushKind};
use crate::replicator::Replicator;
use parking_lot::RwLock;
use ringkv_common::{
    validate_key, FinishReply, Item, RingUpdate, ServerStatus, ShutdownReply, ValidationError,
};
use ringkv_ring::{HashRing, RingError, RingSnapshot, SharedRing};
use ringkv_storage::{PutOutcome, StorageEngine, StorageError};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid ring: {0}")]
    Ring(#[from] RingError),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("server stopped")]
    Stopped,
}

/// Static settings of a storage node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Address clients use; also the node's identity on the ring.
    pub data_addr: String,
    /// Address the coordinator and peers use.
    pub control_addr: String,
    /// Total copies of each key, owner included.
    pub replication_factor: usize,
    /// Maximum concurrent pushes during handoff.
    pub handoff_concurrency: usize,
    /// How long a removed replica worker may drain before it is aborted.
    pub replica_stop_timeout: Duration,
}

impl NodeOptions {
    pub fn new(data_addr: impl Into<String>, control_addr: impl Into<String>) -> Self {
        Self {
            data_addr: data_addr.into(),
            control_addr: control_addr.into(),
            replication_factor: 3,
            handoff_concurrency: 16,
            replica_stop_timeout: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands and replies
// ---------------------------------------------------------------------------

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Put { key: String, value: Vec<u8> },
    Get { key: String },
    Delete { key: String },
    /// Live items whose key contains `prefix`.
    Scan { prefix: String },
    /// The write ranges of the current ring.
    KeyRange,
    /// The read ranges of the current ring.
    KeyRangeRead,
}

impl KvCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Get { .. } => "get",
            Self::Delete { .. } => "delete",
            Self::Scan { .. } => "scan",
            Self::KeyRange => "keyrange",
            Self::KeyRangeRead => "keyrange_read",
        }
    }
}

/// The answer to a [`KvCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    /// Put of a new key, or delete of a live one.
    Success,
    /// Put that replaced a live value.
    Updated,
    Value(Vec<u8>),
    /// Get or delete of an absent key.
    NotFound,
    Items(Vec<(String, Vec<u8>)>),
    KeyRange(String),
    /// The node is bootstrapping or has shut down.
    ServerStopped,
    /// The node is write-locked during a handoff.
    WriteLock,
    /// Another node serves this key; `keyrange` is this node's current ring.
    NotResponsible { keyrange: String },
    Invalid(String),
    Failed(String),
}

impl KvReply {
    fn rejection_reason(&self) -> Option<&'static str> {
        match self {
            Self::ServerStopped => Some("stopped"),
            Self::WriteLock => Some("write_lock"),
            Self::NotResponsible { .. } => Some("not_responsible"),
            Self::Invalid(_) => Some("invalid"),
            Self::Failed(_) => Some("failed"),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeServer
// ---------------------------------------------------------------------------

pub struct NodeServer<P: PeerClient, C: ControlPlane> {
    options: NodeOptions,
    storage: Arc<StorageEngine>,
    ring: SharedRing,
    status: RwLock<ServerStatus>,
    replicator: Replicator<P, C>,
    peer_client: Arc<P>,
    control: Arc<C>,
    /// Handoff rounds run one at a time, in ring order.
    handoff_serial: tokio::sync::Mutex<()>,
}

impl<P: PeerClient, C: ControlPlane> std::fmt::Debug for NodeServer<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("options", &self.options)
            .field("status", &self.status())
            .field("ring_version", &self.ring.load().version)
            .finish_non_exhaustive()
    }
}

impl<P: PeerClient, C: ControlPlane> NodeServer<P, C> {
    pub fn new(
        options: NodeOptions,
        storage: Arc<StorageEngine>,
        peer_client: Arc<P>,
        control: Arc<C>,
    ) -> Self {
        let replicator = Replicator::new(
            peer_client.clone(),
            control.clone(),
            options.replica_stop_timeout,
        );
        Self {
            options,
            storage,
            ring: SharedRing::new(),
            status: RwLock::new(ServerStatus::Bootstrapping),
            replicator,
            peer_client,
            control,
            handoff_serial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn data_addr(&self) -> &str {
        &self.options.data_addr
    }

    pub fn control_addr(&self) -> &str {
        &self.options.control_addr
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// The node's current ring snapshot.
    pub fn ring(&self) -> Arc<RingSnapshot> {
        self.ring.load()
    }

    /// Data addresses of the current replica peers.
    pub fn replica_peers(&self) -> Vec<String> {
        self.replicator.peers()
    }

    // -----------------------------------------------------------------------
    // Client requests
    // -----------------------------------------------------------------------

    /// Handle one client command.
    pub fn handle(&self, cmd: KvCommand) -> KvReply {
        let op = cmd.name();
        let m = ringkv_metrics::metrics();
        m.kv_ops.with_label_values(&[op]).inc();
        let _timer = ringkv_metrics::start_kv_timer(op);

        let reply = self.dispatch(cmd);
        if let Some(reason) = reply.rejection_reason() {
            m.kv_rejections.with_label_values(&[reason]).inc();
            tracing::debug!("{} rejected: {:?}", op, reply);
        }
        reply
    }

    fn dispatch(&self, cmd: KvCommand) -> KvReply {
        let status = self.status();
        if status.is_stopped() {
            return KvReply::ServerStopped;
        }

        let snapshot = self.ring.load();
        let ring = &snapshot.ring;
        let me = self.data_addr();
        let n = self.options.replication_factor;

        match cmd {
            KvCommand::KeyRange => KvReply::KeyRange(ring.serialize()),
            KvCommand::KeyRangeRead => KvReply::KeyRange(ring.serialize_read_ranges(n)),

            KvCommand::Get { key } => {
                if let Err(e) = validate_key(&key) {
                    return KvReply::Invalid(e.to_string());
                }
                if !ring.is_read_responsible(me, &key, n) {
                    return not_responsible(ring);
                }
                match self.storage.get(&key) {
                    Ok(Some(item)) => KvReply::Value(item.value.unwrap_or_default()),
                    Ok(None) => KvReply::NotFound,
                    Err(e) => failed(e),
                }
            }

            KvCommand::Scan { prefix } => match self.storage.scan(&prefix) {
                Ok(items) => KvReply::Items(
                    items
                        .into_iter()
                        .filter(|item| ring.is_read_responsible(me, &item.key, n))
                        .filter_map(|item| Some((item.key, item.value?)))
                        .collect(),
                ),
                Err(e) => failed(e),
            },

            KvCommand::Put { key, value } => self.mutate(Item::put(key, value), status, ring),
            KvCommand::Delete { key } => self.mutate(Item::tombstone(key), status, ring),
        }
    }

    fn mutate(&self, mut item: Item, status: ServerStatus, ring: &HashRing) -> KvReply {
        if let Err(e) = item.validate() {
            return KvReply::Invalid(e.to_string());
        }
        if status == ServerStatus::Balancing {
            return KvReply::WriteLock;
        }
        if !ring.is_responsible(self.data_addr(), &item.key) {
            return not_responsible(ring);
        }

        self.storage.assign_timestamp(&mut item);
        let outcome = match self.storage.put(item.clone()) {
            Ok(outcome) => outcome,
            Err(e) => return failed(e),
        };
        if outcome != PutOutcome::Superseded {
            self.replicator.replicate(&item);
        }

        match (item.is_tombstone(), outcome) {
            (true, PutOutcome::Updated) => KvReply::Success,
            (true, _) => KvReply::NotFound,
            (false, PutOutcome::Updated) => KvReply::Updated,
            (false, _) => KvReply::Success,
        }
    }

    // -----------------------------------------------------------------------
    // Peer pushes
    // -----------------------------------------------------------------------

    /// Store an item pushed by another node. Items transferred to their new
    /// owner are forwarded to its replicas.
    pub fn receive_push(&self, mut item: Item, kind: PushKind) -> Result<PutOutcome, KvError> {
        if self.status() == ServerStatus::Shutdown {
            return Err(KvError::Stopped);
        }
        item.validate()?;
        self.storage.assign_timestamp(&mut item);
        let outcome = self.storage.put(item.clone())?;

        if kind == PushKind::Transfer && outcome != PutOutcome::Superseded {
            let snapshot = self.ring.load();
            if snapshot.ring.is_responsible(self.data_addr(), &item.key) {
                self.replicator.replicate(&item);
            }
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Coordinator messages
    // -----------------------------------------------------------------------

    /// Apply a write lock change. Locking twice is a no-op.
    pub fn set_write_lock(&self, locked: bool) {
        let mut status = self.status.write();
        match (*status, locked) {
            (ServerStatus::Active | ServerStatus::Bootstrapping, true) => {
                tracing::info!("{}: write lock acquired", self.data_addr());
                *status = ServerStatus::Balancing;
            }
            (ServerStatus::Balancing, false) => {
                tracing::info!("{}: write lock released", self.data_addr());
                *status = ServerStatus::Active;
            }
            (current, _) => {
                tracing::debug!(
                    "{}: write lock {} ignored in {}",
                    self.data_addr(),
                    locked,
                    current
                );
            }
        }
    }

    /// Install a ring if it is newer than the current one and refresh the
    /// replica peers. Returns a handoff plan when this node's own range
    /// changed; the caller decides whether to run it inline or in the
    /// background.
    pub async fn apply_ring(&self, update: RingUpdate) -> Result<Option<HandoffPlan>, KvError> {
        let next = Arc::new(RingSnapshot::from_update(&update)?);
        if self.status() == ServerStatus::Shutdown {
            return Ok(None);
        }
        let previous = match self.ring.publish(next.clone()) {
            Some(previous) => previous,
            None => return Ok(None),
        };

        let m = ringkv_metrics::metrics();
        m.ring_updates.inc();
        m.ring_version.set(next.version as i64);
        m.ring_members.set(next.ring.len() as i64);

        let me = self.data_addr();
        tracing::info!(
            "{}: applied ring v{} ({} node(s))",
            me,
            next.version,
            next.ring.len()
        );

        {
            let mut status = self.status.write();
            if *status == ServerStatus::Bootstrapping {
                *status = ServerStatus::Active;
            }
        }

        let peers = if next.ring.contains(me) {
            next.ring
                .replica_peers(me, self.options.replication_factor)
        } else {
            Vec::new()
        };
        self.replicator
            .set_replica_sets(peers, || self.owned_items(&next.ring))
            .await;

        let old_range = previous.ring.range_of(me);
        let new_range = next.ring.range_of(me);
        if old_range.is_none() || old_range == new_range {
            return Ok(None);
        }
        let entries = self.storage.entries()?;
        if new_range.is_some() {
            self.replicate_inherited(&entries, &previous.ring, &next.ring);
        }
        Ok(Some(handoff::plan(me, entries, &previous.ring, &next.ring)))
    }

    /// Forward entries this node owns under `new` but not under `old` to the
    /// current replica peers. These arrive as replica copies or as transfers
    /// received before the ring that makes them ours.
    fn replicate_inherited(&self, entries: &[Item], old: &HashRing, new: &HashRing) {
        let me = self.data_addr();
        let inherited: Vec<&Item> = entries
            .iter()
            .filter(|item| new.owner(&item.key) == Some(me) && old.owner(&item.key) != Some(me))
            .collect();
        if inherited.is_empty() {
            return;
        }
        tracing::info!(
            "{}: replicating {} inherited item(s) to {} peer(s)",
            me,
            inherited.len(),
            self.replicator.peers().len()
        );
        for item in inherited {
            self.replicator.replicate(item);
        }
    }

    /// Apply a ring and run any resulting handoff in the background.
    pub async fn update_ring(self: &Arc<Self>, update: RingUpdate) -> Result<(), KvError> {
        if let Some(plan) = self.apply_ring(update).await? {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run_handoff(plan).await {
                    tracing::warn!("{}: handoff failed: {}", server.data_addr(), e);
                }
            });
        }
        Ok(())
    }

    /// Push the planned items to their new owners, then report to the
    /// coordinator. Nothing is reported when nothing moved, the node holds
    /// no lock and it is still in the ring.
    pub async fn run_handoff(&self, plan: HandoffPlan) -> Result<HandoffReport, KvError> {
        let _serial = self.handoff_serial.lock().await;
        ringkv_metrics::metrics().handoffs.inc();

        let count = plan.transfers.len();
        if count > 0 {
            tracing::info!("{}: handing off {} item(s)", self.data_addr(), count);
        }
        let report = handoff::transfer(
            self.peer_client.clone(),
            self.control.clone(),
            plan.transfers,
            self.options.handoff_concurrency,
        )
        .await;
        if report.failed > 0 {
            tracing::warn!(
                "{}: handoff finished with {} of {} transfer(s) failed",
                self.data_addr(),
                report.failed,
                report.attempted()
            );
        }

        let locked = self.status() == ServerStatus::Balancing;
        if report.attempted() == 0 && !locked && plan.still_member {
            return Ok(report);
        }

        match self.control.finish(self.control_addr()).await? {
            FinishReply::ReleaseLock => self.set_write_lock(false),
            FinishReply::Bye => self.enter_shutdown().await,
        }
        Ok(report)
    }

    /// Register with the coordinator and install the ring it returns.
    pub async fn join(self: &Arc<Self>) -> Result<(), KvError> {
        let update = self
            .control
            .register(self.data_addr(), self.control_addr())
            .await?;
        tracing::info!("{}: registered with coordinator", self.data_addr());
        self.update_ring(update).await
    }

    /// Leave the ring gracefully: stop taking writes, hand everything to the
    /// remaining nodes, and shut down once the coordinator says goodbye.
    pub async fn leave(&self) -> Result<(), KvError> {
        self.set_write_lock(true);

        match self.control.shutdown(self.control_addr()).await? {
            ShutdownReply::Bye => {
                tracing::info!("{}: last node in the ring; stopping", self.data_addr());
                self.enter_shutdown().await;
            }
            ShutdownReply::Handoff(update) => {
                let plan = match self.apply_ring(update).await? {
                    Some(plan) => plan,
                    None => {
                        let current = self.ring.load();
                        handoff::plan(
                            self.data_addr(),
                            self.storage.entries()?,
                            &current.ring,
                            &current.ring,
                        )
                    }
                };
                self.run_handoff(plan).await?;
            }
        }
        Ok(())
    }

    async fn enter_shutdown(&self) {
        *self.status.write() = ServerStatus::Shutdown;
        tracing::info!("{}: shut down", self.data_addr());
        self.replicator.shutdown().await;
    }

    /// Refresh the storage gauges.
    pub fn report_storage_metrics(&self) {
        let stats = self.storage.stats();
        let m = ringkv_metrics::metrics();
        m.storage_segments.set(stats.segments as i64);
        m.memtable_bytes.set(stats.memtable_bytes as i64);
    }

    /// Local entries (tombstones included) this node owns under `ring`.
    fn owned_items(&self, ring: &HashRing) -> Vec<Item> {
        match self.storage.entries() {
            Ok(entries) => entries
                .into_iter()
                .filter(|item| ring.owner(&item.key) == Some(self.data_addr()))
                .collect(),
            Err(e) => {
                tracing::error!("{}: cannot read entries for resync: {}", self.data_addr(), e);
                Vec::new()
            }
        }
    }
}

fn not_responsible(ring: &HashRing) -> KvReply {
    KvReply::NotResponsible {
        keyrange: ring.serialize(),
    }
}

fn failed(e: StorageError) -> KvReply {
    tracing::error!("storage failure: {}", e);
    KvReply::Failed(e.to_string())
}
