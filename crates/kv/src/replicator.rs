//! Per-peer replication fan-out.
//!
//! The replicator keeps one tokio task and one unbounded FIFO mailbox per
//! current replica peer. Every local mutation is enqueued to every mailbox,
//! so ordering is preserved per destination but not across destinations.
//! Mailboxes are unbounded: a slow or unreachable peer grows its queue
//! without backpressure on writers.
//!
//! Peers are known by data address. Each worker asks the coordinator for the
//! peer's control address on first use and forgets it after a failed push.

use crate::peer::{ControlPlane, PeerClient, PushKind};
use parking_lot::Mutex;
use ringkv_common::Item;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Attempts per item before it is dropped.
const PUSH_ATTEMPTS: usize = 2;

#[derive(Debug)]
enum Envelope {
    Item(Item),
    Stop,
}

#[derive(Debug)]
struct PeerWorker {
    mailbox: mpsc::UnboundedSender<Envelope>,
    handle: JoinHandle<()>,
}

/// Replication fan-out to the current replica peers.
pub struct Replicator<P: PeerClient, C: ControlPlane> {
    peer_client: Arc<P>,
    control: Arc<C>,
    stop_timeout: Duration,
    workers: Mutex<HashMap<String, PeerWorker>>,
}

impl<P: PeerClient, C: ControlPlane> std::fmt::Debug for Replicator<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("peers", &self.peers())
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl<P: PeerClient, C: ControlPlane> Replicator<P, C> {
    pub fn new(peer_client: Arc<P>, control: Arc<C>, stop_timeout: Duration) -> Self {
        Self {
            peer_client,
            control,
            stop_timeout,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Current peers (data addresses), sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.workers.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Enqueue an item to every current peer.
    pub fn replicate(&self, item: &Item) {
        let workers = self.workers.lock();
        for (peer, worker) in workers.iter() {
            if worker.mailbox.send(Envelope::Item(item.clone())).is_err() {
                tracing::warn!("replica worker for {} is gone; dropping {:?}", peer, item.key);
            }
        }
    }

    /// Replace the peer set.
    ///
    /// New peers get a worker whose mailbox is seeded with a full resync of
    /// `owned_items()` (called only if there is at least one new peer).
    /// Removed peers receive a stop sentinel and are given `stop_timeout` to
    /// drain before their worker is aborted.
    pub async fn set_replica_sets<F>(&self, peers: Vec<String>, owned_items: F)
    where
        F: FnOnce() -> Vec<Item>,
    {
        let removed: Vec<(String, PeerWorker)> = {
            let mut workers = self.workers.lock();

            let stale: Vec<String> = workers
                .keys()
                .filter(|p| !peers.contains(p))
                .cloned()
                .collect();
            let removed = stale
                .into_iter()
                .filter_map(|p| workers.remove(&p).map(|w| (p, w)))
                .collect();

            let added: Vec<String> = peers
                .into_iter()
                .filter(|p| !workers.contains_key(p))
                .collect();
            if !added.is_empty() {
                // Seeding happens under the lock so that no replicate() can
                // slip in ahead of the resync.
                let resync = owned_items();
                for peer in added {
                    tracing::info!(
                        "adding replica peer {} (resync of {} item(s))",
                        peer,
                        resync.len()
                    );
                    ringkv_metrics::metrics().replication_resyncs.inc();
                    let worker = self.spawn_worker(peer.clone());
                    for item in &resync {
                        let _ = worker.mailbox.send(Envelope::Item(item.clone()));
                    }
                    workers.insert(peer, worker);
                }
            }

            ringkv_metrics::metrics()
                .replication_peers
                .set(workers.len() as i64);
            removed
        };

        let stops = removed
            .into_iter()
            .map(|(peer, worker)| self.stop_worker(peer, worker));
        futures::future::join_all(stops).await;
    }

    /// Stop every worker (graceful shutdown).
    pub async fn shutdown(&self) {
        let all: Vec<(String, PeerWorker)> = self.workers.lock().drain().collect();
        ringkv_metrics::metrics().replication_peers.set(0);
        let stops = all
            .into_iter()
            .map(|(peer, worker)| self.stop_worker(peer, worker));
        futures::future::join_all(stops).await;
    }

    async fn stop_worker(&self, peer: String, worker: PeerWorker) {
        tracing::info!("removing replica peer {}", peer);
        let PeerWorker {
            mailbox,
            mut handle,
        } = worker;
        let _ = mailbox.send(Envelope::Stop);
        drop(mailbox);

        if tokio::time::timeout(self.stop_timeout, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(
                "replica worker for {} did not drain within {:?}; aborting",
                peer,
                self.stop_timeout
            );
            handle.abort();
        }
    }

    fn spawn_worker(&self, peer: String) -> PeerWorker {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(
            peer,
            rx,
            self.peer_client.clone(),
            self.control.clone(),
        ));
        PeerWorker { mailbox, handle }
    }
}

async fn run_worker<P: PeerClient, C: ControlPlane>(
    peer: String,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    peer_client: Arc<P>,
    control: Arc<C>,
) {
    let m = ringkv_metrics::metrics();
    let mut control_addr: Option<String> = None;

    while let Some(envelope) = rx.recv().await {
        let item = match envelope {
            Envelope::Item(item) => item,
            Envelope::Stop => break,
        };

        let mut delivered = false;
        for _ in 0..PUSH_ATTEMPTS {
            let target = match &control_addr {
                Some(addr) => addr.clone(),
                None => match control.resolve_control(&peer).await {
                    Ok(addr) => {
                        control_addr = Some(addr.clone());
                        addr
                    }
                    Err(e) => {
                        tracing::warn!("cannot resolve replica peer {}: {}", peer, e);
                        continue;
                    }
                },
            };

            match peer_client.push(&target, &item, PushKind::Replicate).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "replication of {:?} to {} ({}) failed: {}",
                        item.key,
                        peer,
                        target,
                        e
                    );
                    control_addr = None;
                }
            }
        }

        if delivered {
            m.replication_sent.inc();
        } else {
            m.replication_failed.inc();
        }
    }

    tracing::debug!("replica worker for {} stopped", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerError;
    use ringkv_common::{FinishReply, RingUpdate, ShutdownReply};
    use std::collections::HashSet;

    /// Records every push; optionally hangs or fails for some targets.
    #[derive(Default)]
    struct RecordingPeer {
        pushed: Mutex<Vec<(String, String)>>,
        hang: HashSet<String>,
        fail_once: Mutex<HashSet<String>>,
    }

    impl RecordingPeer {
        fn pushed_to(&self, target: &str) -> Vec<String> {
            self.pushed
                .lock()
                .iter()
                .filter(|(t, _)| t == target)
                .map(|(_, k)| k.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl PeerClient for RecordingPeer {
        async fn push(
            &self,
            target_control: &str,
            item: &Item,
            kind: PushKind,
        ) -> Result<(), PeerError> {
            assert_eq!(kind, PushKind::Replicate);
            if self.hang.contains(target_control) {
                futures::future::pending::<()>().await;
            }
            if self.fail_once.lock().remove(target_control) {
                return Err(PeerError::RpcFailed("connection reset".into()));
            }
            self.pushed
                .lock()
                .push((target_control.to_string(), item.key.clone()));
            Ok(())
        }
    }

    /// Maps `data` to `ctl-data`.
    #[derive(Default)]
    struct PrefixControl {
        resolutions: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ControlPlane for PrefixControl {
        async fn register(&self, _d: &str, _c: &str) -> Result<RingUpdate, PeerError> {
            unreachable!()
        }
        async fn resolve_control(&self, data_addr: &str) -> Result<String, PeerError> {
            *self.resolutions.lock() += 1;
            Ok(format!("ctl-{}", data_addr))
        }
        async fn finish(&self, _c: &str) -> Result<FinishReply, PeerError> {
            unreachable!()
        }
        async fn shutdown(&self, _c: &str) -> Result<ShutdownReply, PeerError> {
            unreachable!()
        }
    }

    fn replicator(
        peer: RecordingPeer,
    ) -> (
        Replicator<RecordingPeer, PrefixControl>,
        Arc<RecordingPeer>,
        Arc<PrefixControl>,
    ) {
        let peer = Arc::new(peer);
        let control = Arc::new(PrefixControl::default());
        let r = Replicator::new(peer.clone(), control.clone(), Duration::from_millis(100));
        (r, peer, control)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_fan_out_preserves_per_peer_order() {
        let (r, peer, _) = replicator(RecordingPeer::default());
        r.set_replica_sets(vec!["a:1".into(), "b:1".into()], Vec::new)
            .await;
        assert_eq!(r.peers(), vec!["a:1".to_string(), "b:1".to_string()]);

        for i in 0..20 {
            r.replicate(&Item::put(format!("k{:02}", i), "v").with_timestamp(i + 1));
        }
        r.replicate(&Item::tombstone("k00").with_timestamp(100));

        wait_for(|| peer.pushed_to("ctl-a:1").len() == 21 && peer.pushed_to("ctl-b:1").len() == 21)
            .await;

        let mut expected: Vec<String> = (0..20).map(|i| format!("k{:02}", i)).collect();
        expected.push("k00".into());
        assert_eq!(peer.pushed_to("ctl-a:1"), expected);
        assert_eq!(peer.pushed_to("ctl-b:1"), expected);
    }

    #[tokio::test]
    async fn test_new_peer_gets_resync_before_new_writes() {
        let (r, peer, _) = replicator(RecordingPeer::default());
        r.set_replica_sets(vec!["a:1".into()], Vec::new).await;

        let owned = vec![
            Item::put("x", "1").with_timestamp(1),
            Item::put("y", "2").with_timestamp(2),
        ];
        r.set_replica_sets(vec!["a:1".into(), "b:1".into()], || owned.clone())
            .await;
        r.replicate(&Item::put("z", "3").with_timestamp(3));

        wait_for(|| peer.pushed_to("ctl-b:1").len() == 3).await;
        assert_eq!(peer.pushed_to("ctl-b:1"), vec!["x", "y", "z"]);
        // The existing peer is not resynced.
        wait_for(|| peer.pushed_to("ctl-a:1").len() == 1).await;
        assert_eq!(peer.pushed_to("ctl-a:1"), vec!["z"]);
    }

    #[tokio::test]
    async fn test_removed_peer_stops_receiving() {
        let (r, peer, _) = replicator(RecordingPeer::default());
        r.set_replica_sets(vec!["a:1".into(), "b:1".into()], Vec::new)
            .await;
        r.replicate(&Item::put("first", "v").with_timestamp(1));

        r.set_replica_sets(vec!["a:1".into()], Vec::new).await;
        assert_eq!(r.peers(), vec!["a:1".to_string()]);
        // Items queued before the stop sentinel are drained.
        assert_eq!(peer.pushed_to("ctl-b:1"), vec!["first"]);

        r.replicate(&Item::put("second", "v").with_timestamp(2));
        wait_for(|| peer.pushed_to("ctl-a:1").len() == 2).await;
        assert_eq!(peer.pushed_to("ctl-b:1"), vec!["first"]);
    }

    #[tokio::test]
    async fn test_stuck_peer_is_aborted_after_timeout() {
        let mut hang = HashSet::new();
        hang.insert("ctl-slow:1".to_string());
        let (r, _, _) = replicator(RecordingPeer {
            hang,
            ..Default::default()
        });
        r.set_replica_sets(vec!["slow:1".into()], Vec::new).await;
        r.replicate(&Item::put("k", "v").with_timestamp(1));

        let started = tokio::time::Instant::now();
        r.set_replica_sets(Vec::new(), Vec::new).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(r.peers().is_empty());
    }

    #[tokio::test]
    async fn test_failed_push_re_resolves_and_retries() {
        let mut fail_once = HashSet::new();
        fail_once.insert("ctl-a:1".to_string());
        let (r, peer, control) = replicator(RecordingPeer {
            fail_once: Mutex::new(fail_once),
            ..Default::default()
        });
        r.set_replica_sets(vec!["a:1".into()], Vec::new).await;
        r.replicate(&Item::put("k", "v").with_timestamp(1));

        wait_for(|| peer.pushed_to("ctl-a:1").len() == 1).await;
        assert_eq!(*control.resolutions.lock(), 2);
    }

    #[tokio::test]
    async fn test_resync_not_computed_without_new_peers() {
        let (r, _, _) = replicator(RecordingPeer::default());
        r.set_replica_sets(vec!["a:1".into()], Vec::new).await;
        r.set_replica_sets(vec!["a:1".into()], || panic!("no new peers"))
            .await;
    }
}
