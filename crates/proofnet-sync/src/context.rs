//! Configuration and the per-node context every connection shares.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use proofnet_core::NodeId;
use proofnet_store::Store;

use crate::connection::{BoxedStream, Connection, ConnectionId};
use crate::deferred::{ClosestNode, LocalCustody};
use crate::lock::LocalLock;
use crate::phase::SubRootType;
use crate::salutation::Splicer;
use crate::wire::DEFAULT_MAX_FRAME_LEN;

/// Timing of the distributed lock handshake.
///
/// The initiator waits `base_timeout_ms` plus a uniformly random jitter of
/// up to `jitter_ms` for its local lock before refusing and letting the
/// counterpart retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub base_timeout_ms: u64,
    pub jitter_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 250,
            jitter_ms: 250,
        }
    }
}

impl LockConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    /// Base timeout plus fresh random jitter.
    pub fn jittered_timeout(&self) -> Duration {
        use rand::Rng;
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.base_timeout_ms.saturating_add(jitter))
    }
}

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time budget of one dialog.
    pub dialog_budget_ms: u64,
    /// How long an idle loop waits before proposing valediction.
    pub idle_timeout_ms: u64,
    /// Maximum frame body size accepted from a peer.
    pub max_frame_len: usize,
    /// Deferred-message redirects a sender follows before giving up.
    pub max_redirects: usize,
    /// Sub-roots this node accepts as a responder.
    pub sub_roots: Vec<SubRootType>,
    pub lock: LockConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dialog_budget_ms: 30_000,
            idle_timeout_ms: 60_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_redirects: 4,
            sub_roots: SubRootType::ALL.to_vec(),
            lock: LockConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn dialog_budget(&self) -> Duration {
        Duration::from_millis(self.dialog_budget_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn accepts(&self, kind: SubRootType) -> bool {
        self.sub_roots.contains(&kind)
    }
}

/// Everything a connection needs from its node, built once at startup and
/// passed by reference.
pub struct SyncContext {
    node: NodeId,
    store: Arc<dyn Store>,
    lock: LocalLock,
    routes: Arc<dyn ClosestNode>,
    splicer: Option<Arc<dyn Splicer>>,
    config: SyncConfig,
    next_connection: AtomicU64,
}

impl SyncContext {
    /// A context that keeps every deferred message it is handed and cannot
    /// splice connections.
    pub fn new(node: NodeId, store: Arc<dyn Store>, config: SyncConfig) -> Self {
        Self {
            node,
            store,
            lock: LocalLock::new(),
            routes: Arc::new(LocalCustody::new(node)),
            splicer: None,
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn with_routes(mut self, routes: Arc<dyn ClosestNode>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_splicer(mut self, splicer: Arc<dyn Splicer>) -> Self {
        self.splicer = Some(splicer);
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The node-wide store lock shared by all connections.
    pub fn lock(&self) -> &LocalLock {
        &self.lock
    }

    pub fn routes(&self) -> &Arc<dyn ClosestNode> {
        &self.routes
    }

    pub fn splicer(&self) -> Option<&Arc<dyn Splicer>> {
        self.splicer.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a fresh stream in a connection with a new id.
    pub fn connection(&self, stream: BoxedStream, remote_addr: Option<SocketAddr>) -> Connection {
        Connection::new(
            self.next_connection_id(),
            stream,
            remote_addr,
            self.config.max_frame_len,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"idle_timeout_ms": 500, "lock": {"jitter_ms": 0}}"#).unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.lock.jitter_ms, 0);
        assert_eq!(config.lock.base_timeout_ms, 250);
        assert_eq!(config.dialog_budget_ms, 30_000);
        assert!(config.accepts(SubRootType::Statement));
    }

    #[test]
    fn test_jitter_bounds() {
        let lock = LockConfig {
            base_timeout_ms: 10,
            jitter_ms: 5,
        };
        for _ in 0..100 {
            let t = lock.jittered_timeout();
            assert!(t >= Duration::from_millis(10) && t <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_extreme_lock_timeouts_saturate() {
        let lock = LockConfig {
            base_timeout_ms: u64::MAX,
            jitter_ms: u64::MAX,
        };
        assert_eq!(lock.jittered_timeout(), Duration::from_millis(u64::MAX));
    }
}
