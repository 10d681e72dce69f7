//! DistributedLockProvider - 有効期限付きの名前付き排他ロック
//!
//! # フロー
//! 1. ロック行を insert（unique 制約で排他）
//! 2. 既存行があれば読み、リース切れなら acquired_at を楽観的に更新して奪取
//! 3. 有効なロックならデッドラインまで最大 1 秒ずつ待ってやり直す
//!
//! 競合はすべてここで吸収し、呼び出し元に返るのは LockTimeout だけです。
//! 破棄はストアとの往復の合間（待機中）にだけ確認し、取得直後に破棄されていれば解放してから Disposed を返します。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::storage::STORAGE_NAME;
use crate::domain::errors::{require_name, require_positive};
use crate::domain::{LockRecord, StorageError};
use crate::ports::{Clock, Store, WriteOutcome};

/// Longest single sleep between two acquisition attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

enum Attempt {
    Acquired,
    /// Someone else holds a live lease.
    Held,
    /// Lost a race against another actor; try again right away.
    Retry,
}

pub struct DistributedLockProvider {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lease: Duration,
    shutdown: CancellationToken,
}

impl DistributedLockProvider {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            store,
            clock,
            lease,
            shutdown: CancellationToken::new(),
        }
    }

    /// Fail acquisitions with `Disposed` once `shutdown` fires.
    pub(crate) fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Block until `resource` is held or `timeout` elapses.
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<LockHandle, StorageError> {
        require_name("resource", resource)?;
        require_positive("timeout", timeout)?;

        // None: the timeout is beyond what Instant can represent, wait forever
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.shutdown.is_cancelled() {
                return Err(StorageError::Disposed(STORAGE_NAME));
            }
            match self.try_acquire(resource).await? {
                Attempt::Acquired => {
                    let handle = LockHandle::new(resource, Arc::clone(&self.store));
                    if self.shutdown.is_cancelled() {
                        debug!(resource, "disposed during acquisition; releasing");
                        handle.release().await?;
                        return Err(StorageError::Disposed(STORAGE_NAME));
                    }
                    debug!(resource, "lock acquired");
                    return Ok(handle);
                }
                Attempt::Retry => continue,
                Attempt::Held => {}
            }

            let delay = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StorageError::LockTimeout {
                            resource: resource.to_string(),
                            timeout,
                        });
                    }
                    (deadline - now).min(MAX_RETRY_DELAY)
                }
                None => MAX_RETRY_DELAY,
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(StorageError::Disposed(STORAGE_NAME)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_acquire(&self, resource: &str) -> Result<Attempt, StorageError> {
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        if tx.insert_lock(&LockRecord::new(resource, now)).await?.is_applied() {
            return Ok(match tx.commit().await? {
                WriteOutcome::Applied => Attempt::Acquired,
                WriteOutcome::Conflict => Attempt::Retry,
            });
        }
        // the failed insert ends this transaction; read in a fresh one
        drop(tx);

        let mut tx = self.store.begin().await?;
        let Some(existing) = tx.find_lock(resource).await? else {
            // released between our insert and this read
            return Ok(Attempt::Retry);
        };
        if !existing.is_expired(self.lease, now) {
            return Ok(Attempt::Held);
        }

        let outcome = tx
            .update_lock(resource, existing.acquired_at, now)
            .await?;
        if !outcome.is_applied() {
            return Ok(Attempt::Retry);
        }
        match tx.commit().await? {
            WriteOutcome::Applied => {
                warn!(
                    resource,
                    acquired_at = %existing.acquired_at,
                    "took over expired lock"
                );
                Ok(Attempt::Acquired)
            }
            WriteOutcome::Conflict => Ok(Attempt::Retry),
        }
    }
}

/// A held lock.
///
/// Call [`LockHandle::release`] when the critical section ends. Dropping an
/// unreleased handle spawns the release on the current runtime as a fallback.
pub struct LockHandle {
    resource: String,
    store: Arc<dyn Store>,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resource", &self.resource)
            .field("released", &self.released)
            .finish()
    }
}

impl LockHandle {
    fn new(resource: &str, store: Arc<dyn Store>) -> Self {
        Self {
            resource: resource.to_string(),
            store,
            released: false,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub async fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        release_lock(self.store.as_ref(), &self.resource).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let resource = std::mem::take(&mut self.resource);
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(resource = %resource, "lock handle dropped without release; releasing");
                runtime.spawn(async move {
                    if let Err(err) = release_lock(store.as_ref(), &resource).await {
                        warn!(resource = %resource, error = %err, "deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    resource = %resource,
                    "lock handle dropped outside a runtime; the lock stays until its lease expires"
                );
            }
        }
    }
}

/// Delete the lock row. A row that is already gone counts as released.
async fn release_lock(store: &dyn Store, resource: &str) -> Result<(), StorageError> {
    let mut tx = store.begin().await?;
    match tx.delete_lock(resource).await? {
        WriteOutcome::Applied => {
            if !tx.commit().await?.is_applied() {
                debug!(resource, "lock removed concurrently; store wins");
            }
        }
        WriteOutcome::Conflict => debug!(resource, "lock was already released"),
    }
    Ok(())
}
