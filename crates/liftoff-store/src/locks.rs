use crate::backend::StateBackend;
use crate::StoreError;
use liftoff_schema::{default_holder, Lock, LockKey, LockRequest, LockToken, OperationType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Acquires and releases per-key exclusive locks in the state backend.
///
/// Acquisition never blocks: a live lock on the key fails immediately with
/// [`StoreError::LockHeld`] carrying the current holder.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn StateBackend>,
    holder: String,
    lease: Option<Duration>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            holder: default_holder(),
            lease: None,
        }
    }

    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn acquire(&self, key: &LockKey, operation: OperationType) -> Result<Lock, StoreError> {
        let request = LockRequest::new(operation)
            .with_holder(self.holder.clone())
            .with_lease(self.lease);
        let lock = self.backend.acquire_lock(key, &request).await?;
        debug!(key = %key, operation = %operation, "lock acquired");
        Ok(lock)
    }

    /// Acquire and wrap in a [`LockGuard`].
    pub async fn acquire_guard(
        &self,
        key: &LockKey,
        operation: OperationType,
    ) -> Result<LockGuard, StoreError> {
        let lock = self.acquire(key, operation).await?;
        Ok(LockGuard {
            lock,
            backend: Arc::clone(&self.backend),
            released: false,
        })
    }

    /// Fails with `LockMismatch` if `lock` is no longer the live lock.
    pub async fn release(&self, lock: &Lock) -> Result<(), StoreError> {
        self.backend.release_lock(&lock.key, &lock.token).await?;
        debug!(key = %lock.key, "lock released");
        Ok(())
    }

    /// Remove any lock on `key`; for locks orphaned by a terminated process.
    pub async fn force_release(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        let removed = self.backend.force_release_lock(key).await?;
        match &removed {
            Some(lock) => warn!(
                key = %key,
                holder = %lock.holder,
                operation = %lock.operation,
                acquired_at = %lock.acquired_at,
                "lock force-released"
            ),
            None => info!(key = %key, "force-release: no lock present"),
        }
        Ok(removed)
    }

    pub async fn inspect(&self, key: &LockKey) -> Result<Option<Lock>, StoreError> {
        self.backend.read_lock(key).await
    }
}

/// A held lock that is released on every exit path.
///
/// Call [`release`](Self::release) on the normal path. A guard dropped
/// unreleased (early return, panic, cancelled future) spawns a release task
/// on the current tokio runtime.
pub struct LockGuard {
    lock: Lock,
    backend: Arc<dyn StateBackend>,
    released: bool,
}

impl LockGuard {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn key(&self) -> &LockKey {
        &self.lock.key
    }

    pub fn token(&self) -> &LockToken {
        &self.lock.token
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        let result = self
            .backend
            .release_lock(&self.lock.key, &self.lock.token)
            .await;
        // Only reached if the release future ran to completion.
        self.released = true;
        result?;
        debug!(key = %self.lock.key, "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = self.lock.key.clone();
        let token = self.lock.token.clone();
        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "releasing dropped lock in background");
                handle.spawn(async move {
                    if let Err(e) = backend.release_lock(&key, &token).await {
                        warn!(key = %key, error = %e, "background lock release failed");
                    }
                });
            }
            Err(_) => warn!(key = %key, "lock dropped outside a runtime; use force-unlock"),
        }
    }
}
