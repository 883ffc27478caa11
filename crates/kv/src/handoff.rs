//! Handoff: moving items to their new owners after a ring change.
//!
//! A node computes the items that leave its range, pushes each one to the
//! new owner through a bounded concurrent stream, and reports how it went.
//! Transfers are awaited without an overall deadline: a peer that never
//! answers stalls the round (and therefore the coordinator's lock release)
//! until its RPC fails.

use crate::peer::{ControlPlane, PeerClient, PushKind};
use futures::stream::{self, StreamExt};
use ringkv_common::Item;
use ringkv_ring::HashRing;
use std::collections::HashMap;
use std::sync::Arc;

/// Items leaving this node, each paired with its new owner's data address.
#[derive(Debug, Clone, Default)]
pub struct HandoffPlan {
    pub transfers: Vec<(String, Item)>,
    /// Whether this node is still part of the new ring.
    pub still_member: bool,
}

/// Outcome of a handoff round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffReport {
    pub transferred: usize,
    pub failed: usize,
}

impl HandoffReport {
    pub fn attempted(&self) -> usize {
        self.transferred + self.failed
    }
}

/// Work out which local entries move when the ring goes from `old` to `new`.
///
/// If `self_addr` is still in `new`, an entry moves when `self_addr` owned it
/// under `old` and someone else owns it under `new`. If `self_addr` has left,
/// every entry moves. Tombstones move like live values so deletes survive.
pub fn plan(self_addr: &str, entries: Vec<Item>, old: &HashRing, new: &HashRing) -> HandoffPlan {
    let still_member = new.contains(self_addr);

    let transfers = entries
        .into_iter()
        .filter(|item| !still_member || old.owner(&item.key) == Some(self_addr))
        .filter_map(|item| {
            let owner = new.owner(&item.key)?;
            (owner != self_addr).then(|| (owner.to_string(), item))
        })
        .collect();

    HandoffPlan {
        transfers,
        still_member,
    }
}

/// Push every planned item to its new owner, at most `concurrency` at a time.
pub async fn transfer<P: PeerClient, C: ControlPlane>(
    peer_client: Arc<P>,
    control: Arc<C>,
    transfers: Vec<(String, Item)>,
    concurrency: usize,
) -> HandoffReport {
    // Resolve each distinct owner once up front.
    let mut owners: HashMap<String, Option<String>> = HashMap::new();
    for (owner, _) in &transfers {
        if owners.contains_key(owner) {
            continue;
        }
        let resolved = match control.resolve_control(owner).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!("handoff: cannot resolve new owner {}: {}", owner, e);
                None
            }
        };
        owners.insert(owner.clone(), resolved);
    }
    let owners = Arc::new(owners);

    let results: Vec<bool> = stream::iter(transfers)
        .map(|(owner, item)| {
            let peer_client = peer_client.clone();
            let owners = owners.clone();
            async move {
                let Some(Some(target)) = owners.get(&owner) else {
                    return false;
                };
                match peer_client.push(target, &item, PushKind::Transfer).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            "handoff of {:?} to {} failed: {}",
                            item.key,
                            owner,
                            e
                        );
                        false
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let transferred = results.iter().filter(|ok| **ok).count();
    let report = HandoffReport {
        transferred,
        failed: results.len() - transferred,
    };
    ringkv_metrics::metrics()
        .handoff_items
        .inc_by(report.transferred as u64);
    report
}
