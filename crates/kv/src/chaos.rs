//! Chaos injection wrapper for [`PeerClient`].
//!
//! [`ChaosPeerClient`] wraps any `P: PeerClient` and injects configurable
//! failures: random errors, per-target failures, and latency.

use crate::peer::{PeerClient, PeerError, PushKind};
use ringkv_common::Item;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for push chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`PeerClient`] wrapper that injects chaos (failures, latency, per-target blocks).
pub struct ChaosPeerClient<P: PeerClient> {
    inner: Arc<P>,
    config: Arc<RwLock<ChaosConfig>>,
    /// Control addresses explicitly marked as unreachable.
    failed_targets: Arc<RwLock<HashSet<String>>>,
}

impl<P: PeerClient> std::fmt::Debug for ChaosPeerClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosPeerClient").finish_non_exhaustive()
    }
}

impl<P: PeerClient> ChaosPeerClient<P> {
    pub fn new(inner: P, config: ChaosConfig) -> Self {
        Self::from_arc(Arc::new(inner), config)
    }

    pub fn from_arc(inner: Arc<P>, config: ChaosConfig) -> Self {
        Self {
            inner,
            config: Arc::new(RwLock::new(config)),
            failed_targets: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Make every push to `target_control` fail until recovered.
    pub async fn fail_target(&self, target_control: &str) {
        self.failed_targets
            .write()
            .await
            .insert(target_control.to_string());
    }

    pub async fn recover_target(&self, target_control: &str) {
        self.failed_targets.write().await.remove(target_control);
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    /// Apply chaos checks: returns Err if the push should fail.
    async fn maybe_fail(&self, target_control: &str) -> Result<(), PeerError> {
        if self.failed_targets.read().await.contains(target_control) {
            return Err(PeerError::RpcFailed(
                "chaos: target marked as failed".into(),
            ));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (
                config.latency + Duration::from_millis(jitter_ms),
                config.failure_rate,
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(PeerError::RpcFailed("chaos: random failure".into()));
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl<P: PeerClient> PeerClient for ChaosPeerClient<P> {
    async fn push(
        &self,
        target_control: &str,
        item: &Item,
        kind: PushKind,
    ) -> Result<(), PeerError> {
        self.maybe_fail(target_control).await?;
        self.inner.push(target_control, item, kind).await
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPeer {
        delivered: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PeerClient for CountingPeer {
        async fn push(&self, _t: &str, _i: &Item, _k: PushKind) -> Result<(), PeerError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn item() -> Item {
        Item::put("key", "val").with_timestamp(1)
    }

    #[tokio::test]
    async fn test_chaos_passthrough() {
        let inner = Arc::new(CountingPeer::default());
        let chaos = ChaosPeerClient::from_arc(inner.clone(), ChaosConfig::default());
        assert!(chaos.push("ctl-1", &item(), PushKind::Replicate).await.is_ok());
        assert!(chaos.push("ctl-1", &item(), PushKind::Transfer).await.is_ok());
        assert_eq!(inner.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chaos_fail_and_recover_target() {
        let inner = Arc::new(CountingPeer::default());
        let chaos = ChaosPeerClient::from_arc(inner.clone(), ChaosConfig::default());

        chaos.fail_target("ctl-1").await;
        assert!(chaos.push("ctl-1", &item(), PushKind::Replicate).await.is_err());
        // Other targets still work
        assert!(chaos.push("ctl-2", &item(), PushKind::Replicate).await.is_ok());

        chaos.recover_target("ctl-1").await;
        assert!(chaos.push("ctl-1", &item(), PushKind::Replicate).await.is_ok());
        assert_eq!(inner.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chaos_random_failure() {
        let config = ChaosConfig {
            failure_rate: 1.0,
            ..Default::default()
        };
        let chaos = ChaosPeerClient::new(CountingPeer::default(), config);

        for _ in 0..10 {
            assert!(chaos.push("ctl-1", &item(), PushKind::Replicate).await.is_err());
        }

        chaos.set_failure_rate(0.0).await;
        assert!(chaos.push("ctl-1", &item(), PushKind::Replicate).await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_latency() {
        let config = ChaosConfig {
            latency: Duration::from_millis(30),
            jitter: Duration::from_millis(10),
            ..Default::default()
        };
        let chaos = ChaosPeerClient::new(CountingPeer::default(), config);
        let start = tokio::time::Instant::now();
        chaos.push("ctl-1", &item(), PushKind::Replicate).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
