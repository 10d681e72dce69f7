//! PersistentJobQueue - ストア上のキューと可視性リース
//!
//! # Dequeue フロー
//! 1. 要求されたキューの中から「可視」な最小 id のエントリを探す
//!    （fetched_at が NULL、または invisibility timeout より古いクレーム）
//! 2. fetched_at をトークンにした条件付き更新でクレーム。負けたら待たずにやり直す
//! 3. 何もなければ {キャンセル, 破棄, enqueue シグナル, poll 間隔} のいずれかまで待つ
//!
//! 破棄（shutdown）はストアとの往復の合間にだけ確認する。クレームのコミット後に
//! 破棄されていた場合はリースを abandon してから Disposed を返す。
//!
//! プロセス内の `dequeue_gate` は同一インスタンス内の無駄な競合を減らすだけで、
//! 別プロセス間の排他はストアの楽観的チェックだけが保証します。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, futures::Notified};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::lease::FetchedJobLease;
use super::storage::STORAGE_NAME;
use super::transaction::MAX_COMMIT_ATTEMPTS;
use crate::domain::errors::require_name;
use crate::domain::records::stale_before;
use crate::domain::{JobId, QueueEntry, QueueEntryId, StorageError};
use crate::ports::{Clock, Store};

/// Wakes blocked dequeuers of one storage instance.
#[derive(Debug, Default)]
pub struct QueueSignal {
    notify: Notify,
}

impl QueueSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every dequeuer currently waiting.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

enum Claim {
    Claimed(QueueEntry),
    /// Another dequeuer changed the entry between our read and our update.
    Lost,
    Empty,
}

pub struct PersistentJobQueue {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    signal: Arc<QueueSignal>,
    poll_interval: Duration,
    invisibility_timeout: Duration,
    dequeue_gate: Mutex<()>,
    shutdown: CancellationToken,
}

impl PersistentJobQueue {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        signal: Arc<QueueSignal>,
        poll_interval: Duration,
        invisibility_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            signal,
            poll_interval,
            invisibility_timeout,
            dequeue_gate: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Fail dequeues with `Disposed` once `shutdown` fires.
    pub(crate) fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Insert a visible entry for an existing job and wake waiting dequeuers.
    pub async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<QueueEntryId, StorageError> {
        require_name("queue", queue)?;

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let mut tx = self.store.begin().await?;
            let entry_id = tx.insert_queue_entry(queue, job_id).await?;
            if tx.commit().await?.is_applied() {
                debug!(queue, job_id = %job_id, entry_id = %entry_id, "enqueued");
                self.signal.notify();
                return Ok(entry_id);
            }
        }
        Err(StorageError::Store(format!(
            "enqueue of {job_id} onto `{queue}` conflicted {MAX_COMMIT_ATTEMPTS} times"
        )))
    }

    /// Claim the oldest visible entry among `queues`, waiting until one shows up.
    pub async fn dequeue(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> Result<FetchedJobLease, StorageError> {
        if queues.is_empty() {
            return Err(StorageError::invalid_argument(
                "queues",
                "at least one queue is required",
            ));
        }
        for queue in queues {
            require_name("queues", queue)?;
        }
        let queues: Vec<String> = queues.iter().map(|q| q.to_string()).collect();

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if self.shutdown.is_cancelled() {
                return Err(StorageError::Disposed(STORAGE_NAME));
            }

            // Register for the wake-up before looking, so an enqueue that lands
            // between the empty read and the wait is not missed.
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claim = {
                let _gate = self.dequeue_gate.lock().await;
                self.try_claim(&queues).await?
            };
            match claim {
                Claim::Claimed(entry) => {
                    let lease = FetchedJobLease::start(
                        entry,
                        Arc::clone(&self.store),
                        Arc::clone(&self.clock),
                        Arc::clone(&self.signal),
                        self.keep_alive_interval(),
                    );
                    if self.shutdown.is_cancelled() {
                        debug!(entry_id = %lease.entry_id(), "disposed during claim; handing the entry back");
                        lease.abandon().await?;
                        return Err(StorageError::Disposed(STORAGE_NAME));
                    }
                    return Ok(lease);
                }
                Claim::Lost => continue,
                Claim::Empty => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(StorageError::Disposed(STORAGE_NAME)),
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn keep_alive_interval(&self) -> Duration {
        (self.invisibility_timeout / 5).max(Duration::from_millis(1))
    }

    async fn try_claim(&self, queues: &[String]) -> Result<Claim, StorageError> {
        let now = self.clock.now();
        let fetched_before = stale_before(now, self.invisibility_timeout);

        let mut tx = self.store.begin().await?;
        let Some(entry) = tx.next_visible_entry(queues, fetched_before).await? else {
            return Ok(Claim::Empty);
        };
        if !tx
            .update_fetched_at(entry.id, entry.fetched_at, Some(now))
            .await?
            .is_applied()
        {
            debug!(entry_id = %entry.id, "lost claim race");
            return Ok(Claim::Lost);
        }
        if !tx.commit().await?.is_applied() {
            debug!(entry_id = %entry.id, "claim commit conflicted");
            return Ok(Claim::Lost);
        }

        if let Some(previous) = entry.fetched_at {
            warn!(
                entry_id = %entry.id,
                job_id = %entry.job_id,
                queue = %entry.queue,
                fetched_at = %previous,
                "re-delivering entry whose lease expired"
            );
        }
        Ok(Claim::Claimed(QueueEntry {
            fetched_at: Some(now),
            ..entry
        }))
    }
}
