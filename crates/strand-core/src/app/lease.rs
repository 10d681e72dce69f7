//! FetchedJobLease - dequeue が返すクレーム済みエントリのハンドル
//!
//! # ライフサイクル
//! - 生成時に keep-alive タスクを起動し、invisibility_timeout / 5 ごとに fetched_at を更新
//! - `complete()` でエントリを削除、`abandon()` で fetched_at を NULL に戻して再可視化
//! - どちらも呼ばれずに drop された場合は、abandon を 1 回だけバックグラウンドで実行
//!
//! ストア側で行が既に消えていた／他者に更新されていた場合は「ストアの勝ち」として no-op。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::queue::QueueSignal;
use crate::domain::{JobId, QueueEntry, QueueEntryId, StorageError};
use crate::ports::{Clock, Store, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseStatus {
    Active,
    Completed,
    Abandoned,
}

struct LeaseState {
    status: LeaseStatus,
    /// Our last successful write; the token for the next guarded update.
    fetched_at: Option<DateTime<Utc>>,
}

struct LeaseInner {
    entry_id: QueueEntryId,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    signal: Arc<QueueSignal>,
    state: Mutex<LeaseState>,
    /// Mirrors `status != Active` so `Drop` can read it without the lock.
    settled: AtomicBool,
}

/// A claimed queue entry.
///
/// Finish it with [`FetchedJobLease::complete`] or [`FetchedJobLease::abandon`].
/// Dropping an unsettled lease abandons it in the background.
pub struct FetchedJobLease {
    entry: QueueEntry,
    inner: Arc<LeaseInner>,
    keep_alive: CancellationToken,
}

impl std::fmt::Debug for FetchedJobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedJobLease")
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

impl FetchedJobLease {
    pub(crate) fn start(
        entry: QueueEntry,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        signal: Arc<QueueSignal>,
        keep_alive_interval: Duration,
    ) -> Self {
        let inner = Arc::new(LeaseInner {
            entry_id: entry.id,
            store,
            clock,
            signal,
            state: Mutex::new(LeaseState {
                status: LeaseStatus::Active,
                fetched_at: entry.fetched_at,
            }),
            settled: AtomicBool::new(false),
        });
        let keep_alive = CancellationToken::new();
        tokio::spawn(keep_alive_loop(
            Arc::clone(&inner),
            keep_alive_interval,
            keep_alive.clone(),
        ));
        Self {
            entry,
            inner,
            keep_alive,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.entry.job_id
    }

    pub fn queue(&self) -> &str {
        &self.entry.queue
    }

    pub fn entry_id(&self) -> QueueEntryId {
        self.entry.id
    }

    /// Delete the entry: the job was processed.
    pub async fn complete(self) -> Result<(), StorageError> {
        self.keep_alive.cancel();
        self.inner.settle(LeaseStatus::Completed).await
    }

    /// Make the entry visible again.
    pub async fn abandon(self) -> Result<(), StorageError> {
        self.keep_alive.cancel();
        self.inner.settle(LeaseStatus::Abandoned).await
    }
}

impl Drop for FetchedJobLease {
    fn drop(&mut self) {
        self.keep_alive.cancel();
        if self.inner.is_settled() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let entry_id = self.entry.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(entry_id = %entry_id, "lease dropped without complete or abandon; abandoning");
                runtime.spawn(async move {
                    if let Err(err) = inner.settle(LeaseStatus::Abandoned).await {
                        warn!(entry_id = %entry_id, error = %err, "deferred abandon failed");
                    }
                });
            }
            Err(_) => warn!(
                entry_id = %entry_id,
                "lease dropped outside a runtime; the entry reappears after the invisibility timeout"
            ),
        }
    }
}

impl LeaseInner {
    /// Move out of `Active` exactly once. Later calls are no-ops.
    async fn settle(&self, target: LeaseStatus) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.status != LeaseStatus::Active {
            return Ok(());
        }
        state.status = target;
        self.settled.store(true, Ordering::Release);

        let outcome = match target {
            LeaseStatus::Completed => self.delete(state.fetched_at).await?,
            _ => self.write_fetched_at(state.fetched_at, None).await?,
        };
        match outcome {
            WriteOutcome::Applied => {
                debug!(entry_id = %self.entry_id, status = ?target, "lease settled");
                if target == LeaseStatus::Abandoned {
                    self.signal.notify();
                }
            }
            WriteOutcome::Conflict => {
                debug!(
                    entry_id = %self.entry_id,
                    status = ?target,
                    "entry changed by another actor; store wins"
                );
            }
        }
        Ok(())
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// One keep-alive tick. Returns false once renewing is pointless.
    async fn renew(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != LeaseStatus::Active {
            return false;
        }

        let now = self.clock.now();
        match self.write_fetched_at(state.fetched_at, Some(now)).await {
            Ok(WriteOutcome::Applied) => {
                state.fetched_at = Some(now);
                debug!(entry_id = %self.entry_id, "lease renewed");
                true
            }
            Ok(WriteOutcome::Conflict) => {
                warn!(
                    entry_id = %self.entry_id,
                    "lease lost: entry was removed or claimed by another actor"
                );
                false
            }
            Err(err) => {
                warn!(entry_id = %self.entry_id, error = %err, "keep-alive failed; retrying next tick");
                true
            }
        }
    }

    async fn write_fetched_at(
        &self,
        expected: Option<DateTime<Utc>>,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError> {
        let mut tx = self.store.begin().await?;
        match tx.update_fetched_at(self.entry_id, expected, fetched_at).await? {
            WriteOutcome::Applied => tx.commit().await,
            WriteOutcome::Conflict => Ok(WriteOutcome::Conflict),
        }
    }

    async fn delete(&self, expected: Option<DateTime<Utc>>) -> Result<WriteOutcome, StorageError> {
        let mut tx = self.store.begin().await?;
        match tx.delete_queue_entry(self.entry_id, expected).await? {
            WriteOutcome::Applied => tx.commit().await,
            WriteOutcome::Conflict => Ok(WriteOutcome::Conflict),
        }
    }
}

async fn keep_alive_loop(inner: Arc<LeaseInner>, period: Duration, stop: CancellationToken) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                if !inner.renew().await {
                    break;
                }
            }
        }
    }
}
