//! Per-account mutual exclusion.
//!
//! Verify and settle for the same account run one at a time; different
//! accounts never contend. Waiting is bounded by a timeout, and a lock is
//! released when its [`ScopedLock`] is dropped, on every exit path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tollgate_core::AccountId;

/// Idle slots are pruned once the table grows past this many entries.
const PRUNE_THRESHOLD: usize = 1024;

/// The lock could not be acquired within the timeout.
#[derive(Debug, Clone, Error)]
#[error("timed out after {waited:?} waiting for lock on account {account_id}")]
pub struct LockTimeoutError {
    pub account_id: AccountId,
    pub waited: Duration,
}

/// Errors from a lock provider.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error(transparent)]
    Timeout(#[from] LockTimeoutError),

    /// The lock backend itself failed (for a distributed provider).
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),
}

/// Held lock on one account. Dropping it releases the lock.
pub struct ScopedLock {
    account_id: AccountId,
    acquired_at: Instant,
    _guard: Box<dyn Send + Sync>,
}

impl ScopedLock {
    /// Wrap a backend guard. The lock is released when `guard` is dropped.
    pub fn new(account_id: AccountId, guard: impl Send + Sync + 'static) -> Self {
        Self {
            account_id,
            acquired_at: Instant::now(),
            _guard: Box::new(guard),
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        tracing::trace!(
            account_id = %self.account_id,
            held_ms = self.held_for().as_millis() as u64,
            "Account lock released"
        );
    }
}

impl std::fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Provider of per-account locks.
///
/// The in-process [`LocalAccountLocks`] covers a single instance. A
/// deployment running several instances against one ledger plugs in a
/// distributed implementation here.
#[async_trait]
pub trait AccountLock: Send + Sync {
    /// Acquire the lock for `account_id`, waiting at most `timeout`.
    async fn acquire(&self, account_id: &AccountId, timeout: Duration)
        -> Result<ScopedLock, LockError>;
}

/// In-process keyed locks, one async mutex per account.
#[derive(Debug, Default)]
pub struct LocalAccountLocks {
    slots: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalAccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts with a lock slot.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop slots nobody holds or waits on.
    pub fn prune_idle(&self) {
        self.slots
            .lock()
            .retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    fn slot(&self, account_id: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock();
        if slots.len() > PRUNE_THRESHOLD {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        Arc::clone(slots.entry(account_id.clone()).or_default())
    }
}

#[async_trait]
impl AccountLock for LocalAccountLocks {
    async fn acquire(
        &self,
        account_id: &AccountId,
        timeout: Duration,
    ) -> Result<ScopedLock, LockError> {
        let slot = self.slot(account_id);

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => {
                tracing::trace!(account_id = %account_id, "Account lock acquired");
                Ok(ScopedLock::new(account_id.clone(), guard))
            }
            Err(_) => {
                tracing::warn!(
                    account_id = %account_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for account lock"
                );
                Err(LockTimeoutError {
                    account_id: account_id.clone(),
                    waited: timeout,
                }
                .into())
            }
        }
    }
}
