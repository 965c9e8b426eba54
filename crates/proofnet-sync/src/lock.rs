//! The node-wide store lock and the cross-peer lock handshake.
//!
//! Each node has one [`LocalLock`] shared by all its connections; holding it
//! grants write access to the sync-relevant store state. Before a persistent
//! dialog, both peers of a connection take their own local lock:
//!
//! ```text
//!   initiator (Male)                       counterpart (Female)
//!     LockInit ──────────────────────────>
//!                                          acquire local lock (waits)
//!              <────────────────────────── LockRequest
//!     try local lock for base + jitter
//!     LockResponse(Acknowledge) ─────────> done
//!   or
//!     LockResponse(Refuse) ──────────────> release, reacquire, LockRequest
//! ```
//!
//! Only the initiator gives up on a timeout, so two nodes whose connections
//! contend for each other's locks cannot wait on each other forever.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::context::LockConfig;
use crate::dialog::Dialog;
use crate::error::Result;
use crate::salutation::Gender;
use crate::wire::{LockInit, LockRequest, LockResponse};

/// Answer to a [`LockRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    Acknowledge,
    Refuse,
}

/// Exclusive write access to the local store, shared across connections.
#[derive(Debug, Clone, Default)]
pub struct LocalLock {
    inner: Arc<Mutex<()>>,
}

/// Held while a persistent dialog runs. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock. Waiters are served in order.
    pub async fn acquire(&self) -> LockGuard {
        LockGuard {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }

    /// Wait at most `timeout` for the lock.
    pub async fn try_acquire_for(&self, timeout: Duration) -> Option<LockGuard> {
        tokio::time::timeout(timeout, self.acquire()).await.ok()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Run the lock handshake inside `dialog` and return the local guard once
/// both peers hold their locks.
pub async fn acquire_distributed(
    dialog: &mut Dialog<'_>,
    gender: Gender,
    lock: &LocalLock,
    config: &LockConfig,
) -> Result<LockGuard> {
    if gender.is_lock_initiator() {
        dialog.send(&LockInit)?;
        let mut refusals = 0u32;
        loop {
            dialog.recv::<LockRequest>().await?;
            let timeout = config.jittered_timeout();
            match lock.try_acquire_for(timeout).await {
                Some(guard) => {
                    dialog.send(&LockResponse {
                        status: LockStatus::Acknowledge,
                    })?;
                    if refusals > 0 {
                        tracing::debug!(conn = %dialog.connection_id(), refusals, "lock acquired");
                    }
                    return Ok(guard);
                }
                None => {
                    refusals += 1;
                    tracing::debug!(
                        conn = %dialog.connection_id(),
                        timeout_ms = timeout.as_millis() as u64,
                        "local lock busy, refusing"
                    );
                    dialog.send(&LockResponse {
                        status: LockStatus::Refuse,
                    })?;
                }
            }
        }
    } else {
        dialog.recv::<LockInit>().await?;
        loop {
            let guard = lock.acquire().await;
            dialog.send(&LockRequest)?;
            match dialog.recv::<LockResponse>().await?.status {
                LockStatus::Acknowledge => return Ok(guard),
                LockStatus::Refuse => {
                    // Let other local waiters in before asking again.
                    drop(guard);
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}
