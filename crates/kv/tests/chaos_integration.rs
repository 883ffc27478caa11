//! Multi-node replication tests under injected faults.
//!
//! Nodes are wired together in memory: pushes are dispatched straight to the
//! target's `NodeServer::receive_push` through a shared registry, and every
//! node's outbound pushes go through a `ChaosPeerClient`. Rings are fed to
//! the nodes directly, standing in for the coordinator.

use parking_lot::RwLock;
use ringkv_common::{FinishReply, Item, RingUpdate, ShutdownReply};
use ringkv_kv::chaos::{ChaosConfig, ChaosPeerClient};
use ringkv_kv::{
    ControlPlane, KvCommand, KvReply, NodeOptions, NodeServer, PeerClient, PeerError, PushKind,
};
use ringkv_ring::{HashRing, RingSnapshot};
use ringkv_storage::{FsyncPolicy, StorageEngine, StorageOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;

type Node = NodeServer<ChaosPeerClient<MemPeer>, StaticControl>;
type Registry = Arc<RwLock<HashMap<String, Arc<Node>>>>;

// ────────────────────────── In-memory wiring ──────────────────────────

/// Delivers pushes to the target node's `receive_push`.
struct MemPeer {
    registry: Registry,
}

#[async_trait::async_trait]
impl PeerClient for MemPeer {
    async fn push(
        &self,
        target_control: &str,
        item: &Item,
        kind: PushKind,
    ) -> Result<(), PeerError> {
        let node = self
            .registry
            .read()
            .get(target_control)
            .cloned()
            .ok_or_else(|| PeerError::RpcFailed("node not in registry".into()))?;
        node.receive_push(item.clone(), kind)
            .map(|_| ())
            .map_err(|e| PeerError::Rejected(e.to_string()))
    }
}

/// Control addresses are derived from data addresses; nothing else is served.
struct StaticControl;

fn control_of(data_addr: &str) -> String {
    format!("ctl-{}", data_addr)
}

#[async_trait::async_trait]
impl ControlPlane for StaticControl {
    async fn register(&self, _d: &str, _c: &str) -> Result<RingUpdate, PeerError> {
        Err(PeerError::Rejected("no coordinator".into()))
    }
    async fn resolve_control(&self, data_addr: &str) -> Result<String, PeerError> {
        Ok(control_of(data_addr))
    }
    async fn finish(&self, _c: &str) -> Result<FinishReply, PeerError> {
        Err(PeerError::Rejected("no coordinator".into()))
    }
    async fn shutdown(&self, _c: &str) -> Result<ShutdownReply, PeerError> {
        Err(PeerError::Rejected("no coordinator".into()))
    }
}

// ────────────────────────── TestCluster ──────────────────────────

struct TestCluster {
    nodes: Vec<Arc<Node>>,
    chaos_clients: Vec<Arc<ChaosPeerClient<MemPeer>>>,
    addrs: Vec<String>,
    #[allow(dead_code)]
    temp_dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    async fn new(n: usize, replication_factor: usize, chaos: ChaosConfig) -> Self {
        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let mut cluster = TestCluster {
            nodes: Vec::new(),
            chaos_clients: Vec::new(),
            addrs: Vec::new(),
            temp_dirs: Vec::new(),
        };

        for i in 0..n {
            let dir = tempfile::TempDir::new().unwrap();
            let storage = StorageEngine::open(
                dir.path(),
                StorageOptions {
                    fsync: FsyncPolicy::None,
                    ..StorageOptions::default()
                },
            )
            .unwrap();

            let addr = format!("127.0.0.1:{}", 19000 + i);
            let chaos_client = Arc::new(ChaosPeerClient::new(
                MemPeer {
                    registry: registry.clone(),
                },
                chaos.clone(),
            ));
            let mut options = NodeOptions::new(addr.clone(), control_of(&addr));
            options.replication_factor = replication_factor;
            options.replica_stop_timeout = Duration::from_millis(500);

            let node = Arc::new(NodeServer::new(
                options,
                Arc::new(storage),
                chaos_client.clone(),
                Arc::new(StaticControl),
            ));
            registry.write().insert(control_of(&addr), node.clone());

            cluster.nodes.push(node);
            cluster.chaos_clients.push(chaos_client);
            cluster.addrs.push(addr);
            cluster.temp_dirs.push(dir);
        }

        let ring = HashRing::from_nodes(cluster.addrs.iter().map(String::as_str));
        cluster.publish(1, &ring).await;
        cluster
    }

    async fn publish(&self, version: u64, ring: &HashRing) {
        let update = RingSnapshot::new(version, ring.clone()).to_update();
        for node in &self.nodes {
            node.update_ring(update.clone()).await.unwrap();
        }
    }

    fn index_of(&self, addr: &str) -> usize {
        self.addrs.iter().position(|a| a == addr).unwrap()
    }

    fn ring(&self) -> HashRing {
        self.nodes[0].ring().ring.clone()
    }

    /// The node that owns `key`.
    fn owner(&self, key: &str) -> &Arc<Node> {
        let ring = self.ring();
        &self.nodes[self.index_of(ring.owner(key).unwrap())]
    }

    fn stored(&self, idx: usize, key: &str) -> Option<Item> {
        self.nodes[idx].storage().get(key).unwrap()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn put(key: &str, value: &str) -> KvCommand {
    KvCommand::Put {
        key: key.into(),
        value: value.as_bytes().to_vec(),
    }
}

// ────────────────────────── Tests ──────────────────────────

#[tokio::test]
async fn test_writes_reach_every_replica() {
    let cluster = TestCluster::new(3, 3, ChaosConfig::default()).await;

    let keys: Vec<String> = (0..30).map(|i| format!("user{}", i)).collect();
    for key in &keys {
        assert_eq!(cluster.owner(key).handle(put(key, key)), KvReply::Success);
    }

    eventually("all replicas hold every key", || {
        keys.iter()
            .all(|k| (0..3).all(|i| cluster.stored(i, k).is_some()))
    })
    .await;

    // Every node reads every key; replicas hold the owner's timestamp.
    for key in &keys {
        let owner_ts = cluster.owner(key).storage().get(key).unwrap().unwrap().timestamp;
        for (i, node) in cluster.nodes.iter().enumerate() {
            assert_eq!(
                node.handle(KvCommand::Get { key: key.clone() }),
                KvReply::Value(key.as_bytes().to_vec())
            );
            assert_eq!(cluster.stored(i, key).unwrap().timestamp, owner_ts);
        }
    }
}

#[tokio::test]
async fn test_replica_order_preserved_under_latency() {
    let chaos = ChaosConfig {
        latency: Duration::from_millis(1),
        jitter: Duration::from_millis(5),
        ..Default::default()
    };
    let cluster = TestCluster::new(2, 2, chaos).await;
    let owner = cluster.owner("counter").clone();
    let replica = 1 - cluster.index_of(owner.data_addr());

    for i in 0..20 {
        owner.handle(put("counter", &i.to_string()));
    }
    owner.handle(KvCommand::Delete {
        key: "counter".into(),
    });
    owner.handle(put("counter", "final"));

    eventually("replica converges on the last write", || {
        cluster
            .stored(replica, "counter")
            .and_then(|item| item.value)
            .as_deref()
            == Some(&b"final"[..])
    })
    .await;
    let owner_item = owner.storage().get("counter").unwrap().unwrap();
    assert_eq!(
        cluster.stored(replica, "counter").unwrap().timestamp,
        owner_item.timestamp
    );
}

#[tokio::test]
async fn test_delete_replicates_as_tombstone() {
    let cluster = TestCluster::new(3, 2, ChaosConfig::default()).await;
    let ring = cluster.ring();
    let holders: Vec<usize> = ring
        .successors("doomed", 2)
        .iter()
        .map(|a| cluster.index_of(a))
        .collect();
    let owner = cluster.owner("doomed").clone();

    owner.handle(put("doomed", "v"));
    eventually("replica receives the put", || {
        holders.iter().all(|&i| cluster.stored(i, "doomed").is_some())
    })
    .await;

    assert_eq!(
        owner.handle(KvCommand::Delete {
            key: "doomed".into()
        }),
        KvReply::Success
    );
    eventually("replica drops the key", || {
        holders.iter().all(|&i| cluster.stored(i, "doomed").is_none())
    })
    .await;
    for &i in &holders {
        assert_eq!(
            cluster.nodes[i].handle(KvCommand::Get {
                key: "doomed".into()
            }),
            KvReply::NotFound
        );
    }
}

#[tokio::test]
async fn test_unreachable_replica_resynced_on_rejoin() {
    let cluster = TestCluster::new(3, 2, ChaosConfig::default()).await;
    let ring = cluster.ring();

    // Keys owned by node 0; its single replica is its ring successor.
    let owner_addr = cluster.addrs[0].clone();
    let replica_addr = ring.replica_peers(&owner_addr, 2)[0].clone();
    let replica = cluster.index_of(&replica_addr);
    let keys: Vec<String> = (0..2000)
        .map(|i| format!("k{}", i))
        .filter(|k| ring.owner(k) == Some(owner_addr.as_str()))
        .take(10)
        .collect();

    cluster.chaos_clients[0]
        .fail_target(&control_of(&replica_addr))
        .await;
    for key in &keys {
        assert_eq!(cluster.nodes[0].handle(put(key, "v")), KvReply::Success);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(keys.iter().all(|k| cluster.stored(replica, k).is_none()));

    cluster.chaos_clients[0]
        .recover_target(&control_of(&replica_addr))
        .await;

    // The replica leaves and rejoins; node 0 treats it as a new peer and
    // streams everything it owns.
    let mut without = ring.clone();
    without.remove(&replica_addr);
    cluster.nodes[0]
        .update_ring(RingSnapshot::new(2, without).to_update())
        .await
        .unwrap();
    cluster.nodes[0]
        .update_ring(RingSnapshot::new(3, ring.clone()).to_update())
        .await
        .unwrap();

    eventually("replica resynced", || {
        keys.iter().all(|k| cluster.stored(replica, k).is_some())
    })
    .await;
}

#[tokio::test]
async fn test_random_push_failures_leave_owner_consistent() {
    let chaos = ChaosConfig {
        failure_rate: 1.0,
        ..Default::default()
    };
    let cluster = TestCluster::new(3, 3, chaos).await;

    // Replication is best effort: the owner acknowledges regardless.
    for i in 0..10 {
        let key = format!("x{}", i);
        let owner = cluster.owner(&key).clone();
        assert_eq!(owner.handle(put(&key, "v")), KvReply::Success);
        assert_eq!(
            owner.handle(KvCommand::Get { key: key.clone() }),
            KvReply::Value(b"v".to_vec())
        );
    }
    for client in &cluster.chaos_clients {
        client.set_failure_rate(0.0).await;
    }
    let owner = cluster.owner("after").clone();
    owner.handle(put("after", "ok"));
    eventually("replication resumes", || {
        (0..3).all(|i| cluster.stored(i, "after").is_some())
    })
    .await;
}
