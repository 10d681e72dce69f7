//! JobStorage - 外部（ジョブ処理ホスト）に公開するファサード
//!
//! # 所有関係
//! - dequeue の起床シグナルと dequeue_gate はこのインスタンスが所有する
//!   （プロセス全体のシングルトンにはしない。別インスタンス同士は干渉しない）
//! - `dispose()` でインスタンス全体のキャンセルトークンを発火し、以降の操作は Disposed

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::counter_compactor::CounterCompactor;
use super::expiration_sweeper::ExpirationSweeper;
use super::lease::FetchedJobLease;
use super::lock::{DistributedLockProvider, LockHandle};
use super::options::StorageOptions;
use super::process::{BackgroundProcess, ProcessGroup};
use super::queue::{PersistentJobQueue, QueueSignal};
use super::retry::RetryPolicy;
use super::transaction::{MAX_COMMIT_ATTEMPTS, WriteTransaction};
use crate::domain::records::offset;
use crate::domain::{JobId, JobRecord, NewJob, QueueEntryId, StorageError};
use crate::ports::{Clock, Store};

pub(crate) const STORAGE_NAME: &str = "job storage";

pub struct JobStorage {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    options: StorageOptions,
    signal: Arc<QueueSignal>,
    locks: DistributedLockProvider,
    queue: PersistentJobQueue,
    shutdown: CancellationToken,
}

impl JobStorage {
    pub(crate) fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, options: StorageOptions) -> Self {
        let signal = Arc::new(QueueSignal::new());
        let shutdown = CancellationToken::new();
        let locks = DistributedLockProvider::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            options.lock_lease_duration,
        )
        .with_shutdown(shutdown.clone());
        let queue = PersistentJobQueue::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&signal),
            options.queue_poll_interval,
            options.invisibility_timeout,
        )
        .with_shutdown(shutdown.clone());
        Self {
            store,
            clock,
            options,
            signal,
            locks,
            queue,
            shutdown,
        }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Hold `resource` exclusively until the handle is released.
    ///
    /// Disposal is observed between store round-trips, never in the middle of one,
    /// so a lock won just before disposal is released rather than left behind.
    pub async fn acquire_lock(&self, resource: &str, timeout: Duration) -> Result<LockHandle, StorageError> {
        self.ensure_open()?;
        self.locks.acquire(resource, timeout).await
    }

    /// Create a job row. `expire_in == None` keeps it forever.
    pub async fn create_job(
        &self,
        invocation: serde_json::Value,
        expire_in: Option<Duration>,
    ) -> Result<JobId, StorageError> {
        self.ensure_open()?;
        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let now = self.clock.now();
            let mut tx = self.store.begin().await?;
            let id = tx
                .insert_job(NewJob {
                    invocation: invocation.clone(),
                    created_at: now,
                    expire_at: expire_in.and_then(|expire_in| offset(now, expire_in)),
                })
                .await?;
            if tx.commit().await?.is_applied() {
                debug!(job_id = %id, "job created");
                return Ok(id);
            }
        }
        Err(StorageError::Store(format!(
            "job creation conflicted {MAX_COMMIT_ATTEMPTS} times"
        )))
    }

    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        self.ensure_open()?;
        let mut tx = self.store.begin().await?;
        tx.find_job(id).await
    }

    pub async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<QueueEntryId, StorageError> {
        self.ensure_open()?;
        self.queue.enqueue(queue, job_id).await
    }

    /// Claim the oldest visible entry among `queues`.
    ///
    /// Fails with `Cancelled` when `cancel` fires and with `Disposed` when the
    /// storage is disposed while waiting. An entry claimed just before disposal
    /// is abandoned before `Disposed` is returned.
    pub async fn dequeue(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> Result<FetchedJobLease, StorageError> {
        self.ensure_open()?;
        self.queue.dequeue(queues, cancel).await
    }

    pub fn create_write_transaction(&self) -> Result<WriteTransaction, StorageError> {
        self.ensure_open()?;
        Ok(WriteTransaction::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.signal),
        ))
    }

    pub fn counter_compactor(&self) -> CounterCompactor {
        CounterCompactor::new(Arc::clone(&self.store), self.options.counter_compaction_interval)
    }

    pub fn expiration_sweeper(&self) -> ExpirationSweeper {
        ExpirationSweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.options.expiration_sweep_interval,
        )
    }

    /// Run the compactor and the sweeper until the group is shut down or this storage is disposed.
    pub fn spawn_processes(&self) -> Result<ProcessGroup, StorageError> {
        self.ensure_open()?;
        let processes: Vec<Arc<dyn BackgroundProcess>> = vec![
            Arc::new(self.counter_compactor()),
            Arc::new(self.expiration_sweeper()),
        ];
        Ok(ProcessGroup::spawn(
            processes,
            self.shutdown.child_token(),
            RetryPolicy::default(),
        ))
    }

    /// Stop blocked dequeues and background processes. Idempotent.
    pub fn dispose(&self) {
        if !self.shutdown.is_cancelled() {
            info!("disposing job storage");
            self.shutdown.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_disposed() {
            return Err(StorageError::Disposed(STORAGE_NAME));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::StorageBuilder;
    use crate::impls::{FaultyStore, InMemoryStore};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};

    fn storage(store: &InMemoryStore) -> Arc<JobStorage> {
        Arc::new(StorageBuilder::new(Arc::new(store.clone())).build().unwrap())
    }

    #[tokio::test]
    async fn create_job_then_read_it_back() {
        let store = InMemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let storage = StorageBuilder::new(Arc::new(store.clone()))
            .clock(Arc::new(FixedClock::new(now)))
            .build()
            .unwrap();

        let invocation = serde_json::json!({ "type": "Mailer", "method": "send", "args": [42] });
        let id = storage
            .create_job(invocation.clone(), Some(Duration::from_secs(86_400)))
            .await
            .unwrap();

        let job = storage.job(id).await.unwrap().unwrap();
        assert_eq!(job.invocation, invocation);
        assert_eq!(job.created_at, now);
        assert_eq!(job.expire_at, Some(now + chrono::Duration::days(1)));
        assert_eq!(job.state_name, None);

        assert!(storage.job(JobId::new(9_999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispose_unblocks_dequeue_and_rejects_later_calls() {
        let store = InMemoryStore::new();
        let storage = storage(&store);

        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                storage.dequeue(&["default"], &cancel).await.map(|lease| lease.job_id())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        storage.dispose();
        storage.dispose();
        assert!(storage.is_disposed());

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StorageError::Disposed(_)));

        assert!(matches!(
            storage.create_job(serde_json::Value::Null, None).await,
            Err(StorageError::Disposed(_))
        ));
        assert!(matches!(
            storage.acquire_lock("res", Duration::from_secs(1)).await,
            Err(StorageError::Disposed(_))
        ));
        assert!(matches!(storage.create_write_transaction(), Err(StorageError::Disposed(_))));
        assert!(storage.spawn_processes().is_err());
    }

    #[tokio::test]
    async fn disposal_during_a_claim_hands_the_entry_back() {
        let store = InMemoryStore::new();
        let faulty = FaultyStore::new(store.clone());
        let storage = Arc::new(StorageBuilder::new(Arc::new(faulty.clone())).build().unwrap());
        let job = storage.create_job(serde_json::Value::Null, None).await.unwrap();
        storage.enqueue("default", job).await.unwrap();

        faulty.delay_commits(Duration::from_millis(200));
        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                storage.dequeue(&["default"], &cancel).await.map(|lease| lease.job_id())
            })
        };
        // the claim is now waiting on its commit
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.dispose();

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StorageError::Disposed(_)));
        let entries = store.queue_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fetched_at, None);
    }

    #[tokio::test]
    async fn disposal_during_lock_acquisition_releases_the_row() {
        let store = InMemoryStore::new();
        let faulty = FaultyStore::new(store.clone());
        let storage = Arc::new(StorageBuilder::new(Arc::new(faulty.clone())).build().unwrap());

        faulty.delay_commits(Duration::from_millis(200));
        let waiter = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.acquire_lock("res", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.dispose();

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StorageError::Disposed(_)));
        assert!(store.lock_record("res").await.is_none());
    }

    #[tokio::test]
    async fn acquire_lock_accepts_an_unbounded_timeout() {
        let store = InMemoryStore::new();
        let storage = storage(&store);
        storage
            .acquire_lock("res", Duration::MAX)
            .await
            .unwrap()
            .release()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispose_stops_background_processes() {
        let store = InMemoryStore::new();
        let storage = storage(&store);
        let group = storage.spawn_processes().unwrap();

        storage.dispose();
        tokio::time::timeout(Duration::from_secs(5), group.shutdown_and_join())
            .await
            .expect("processes should observe disposal");
    }

    #[tokio::test]
    async fn storages_over_one_store_see_each_others_entries() {
        let store = InMemoryStore::new();
        let a = storage(&store);
        let b = storage(&store);
        let job = a.create_job(serde_json::Value::Null, None).await.unwrap();

        let lease = {
            let cancel = CancellationToken::new();
            b.enqueue("q", job).await.unwrap();
            a.dequeue(&["q"], &cancel).await.unwrap()
        };
        assert_eq!(lease.job_id(), job);
        lease.complete().await.unwrap();
    }
}
