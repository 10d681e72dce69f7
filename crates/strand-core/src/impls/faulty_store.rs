//! FaultyStore - 障害注入用のテストストア
//!
//! InMemoryStore に委譲しつつ、指定回数だけ次の障害を起こします：
//! - `begin()` が `StorageError::Store` を返す
//! - `commit()` が書き込みを捨てて `WriteOutcome::Conflict` を返す
//! - `commit()` の前に一定時間待つ（コミット途中に割り込むテスト用）

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::InMemoryStore;
use crate::domain::{
    CounterDelta, CounterId, ExpirableKind, HashField, JobId, JobRecord, JobStateRecord,
    KeyedKind, ListItem, ListItemId, LockRecord, NewJob, QueueEntry, QueueEntryId, SetMember,
    StateChange, StateId, StorageError,
};
use crate::ports::{Store, StoreTransaction, WriteOutcome};

#[derive(Default)]
struct Faults {
    begin_failures: AtomicUsize,
    commit_conflicts: AtomicUsize,
    commit_delay_ms: AtomicU64,
    begins: AtomicUsize,
    commits: AtomicUsize,
}

/// Decrement `counter` if positive; true when a fault should fire.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Clone)]
pub struct FaultyStore {
    inner: InMemoryStore,
    faults: Arc<Faults>,
}

impl FaultyStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn fail_next_begins(&self, n: usize) {
        self.faults.begin_failures.store(n, Ordering::SeqCst);
    }

    pub fn conflict_next_commits(&self, n: usize) {
        self.faults.commit_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn delay_commits(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.commit_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Successful and failed `begin()` calls.
    pub fn begins(&self) -> usize {
        self.faults.begins.load(Ordering::SeqCst)
    }

    /// `commit()` calls, conflicted ones included.
    pub fn commits(&self) -> usize {
        self.faults.commits.load(Ordering::SeqCst)
    }

    pub fn pending_begin_failures(&self) -> usize {
        self.faults.begin_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        self.faults.begins.fetch_add(1, Ordering::SeqCst);
        if take(&self.faults.begin_failures) {
            return Err(StorageError::Store("injected begin failure".to_string()));
        }
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn StoreTransaction>,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTransaction for FaultyTransaction {
    async fn insert_lock(&mut self, lock: &LockRecord) -> Result<WriteOutcome, StorageError> {
        self.inner.insert_lock(lock).await
    }

    async fn find_lock(&mut self, resource: &str) -> Result<Option<LockRecord>, StorageError> {
        self.inner.find_lock(resource).await
    }

    async fn update_lock(
        &mut self,
        resource: &str,
        expected: DateTime<Utc>,
        acquired_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StorageError> {
        self.inner.update_lock(resource, expected, acquired_at).await
    }

    async fn delete_lock(&mut self, resource: &str) -> Result<WriteOutcome, StorageError> {
        self.inner.delete_lock(resource).await
    }

    async fn insert_job(&mut self, job: NewJob) -> Result<JobId, StorageError> {
        self.inner.insert_job(job).await
    }

    async fn find_job(&mut self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        self.inner.find_job(id).await
    }

    async fn update_job(&mut self, job: &JobRecord) -> Result<WriteOutcome, StorageError> {
        self.inner.update_job(job).await
    }

    async fn insert_job_state(
        &mut self,
        job_id: JobId,
        state: &StateChange,
        created_at: DateTime<Utc>,
    ) -> Result<StateId, StorageError> {
        self.inner.insert_job_state(job_id, state, created_at).await
    }

    async fn job_states(&mut self, job_id: JobId) -> Result<Vec<JobStateRecord>, StorageError> {
        self.inner.job_states(job_id).await
    }

    async fn insert_queue_entry(
        &mut self,
        queue: &str,
        job_id: JobId,
    ) -> Result<QueueEntryId, StorageError> {
        self.inner.insert_queue_entry(queue, job_id).await
    }

    async fn next_visible_entry(
        &mut self,
        queues: &[String],
        fetched_before: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StorageError> {
        self.inner.next_visible_entry(queues, fetched_before).await
    }

    async fn update_fetched_at(
        &mut self,
        id: QueueEntryId,
        expected: Option<DateTime<Utc>>,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError> {
        self.inner.update_fetched_at(id, expected, fetched_at).await
    }

    async fn delete_queue_entry(
        &mut self,
        id: QueueEntryId,
        expected: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError> {
        self.inner.delete_queue_entry(id, expected).await
    }

    async fn insert_counter(
        &mut self,
        key: &str,
        value: i64,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<CounterId, StorageError> {
        self.inner.insert_counter(key, value, expire_at).await
    }

    async fn duplicated_counter_key(&mut self) -> Result<Option<String>, StorageError> {
        self.inner.duplicated_counter_key().await
    }

    async fn counter_deltas(
        &mut self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<CounterDelta>, StorageError> {
        self.inner.counter_deltas(key, limit).await
    }

    async fn delete_counter(&mut self, id: CounterId) -> Result<WriteOutcome, StorageError> {
        self.inner.delete_counter(id).await
    }

    async fn find_set_member(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<Option<SetMember>, StorageError> {
        self.inner.find_set_member(key, value).await
    }

    async fn insert_set_member(
        &mut self,
        member: &SetMember,
    ) -> Result<WriteOutcome, StorageError> {
        self.inner.insert_set_member(member).await
    }

    async fn update_set_member(
        &mut self,
        member: &SetMember,
    ) -> Result<WriteOutcome, StorageError> {
        self.inner.update_set_member(member).await
    }

    async fn delete_set_member(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<WriteOutcome, StorageError> {
        self.inner.delete_set_member(key, value).await
    }

    async fn insert_list_item(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<ListItemId, StorageError> {
        self.inner.insert_list_item(key, value).await
    }

    async fn list_items(&mut self, key: &str) -> Result<Vec<ListItem>, StorageError> {
        self.inner.list_items(key).await
    }

    async fn delete_list_item(&mut self, id: ListItemId) -> Result<WriteOutcome, StorageError> {
        self.inner.delete_list_item(id).await
    }

    async fn find_hash_field(
        &mut self,
        key: &str,
        field: &str,
    ) -> Result<Option<HashField>, StorageError> {
        self.inner.find_hash_field(key, field).await
    }

    async fn insert_hash_field(&mut self, field: &HashField) -> Result<WriteOutcome, StorageError> {
        self.inner.insert_hash_field(field).await
    }

    async fn update_hash_field(&mut self, field: &HashField) -> Result<WriteOutcome, StorageError> {
        self.inner.update_hash_field(field).await
    }

    async fn delete_key(&mut self, kind: KeyedKind, key: &str) -> Result<usize, StorageError> {
        self.inner.delete_key(kind, key).await
    }

    async fn set_key_expiry(
        &mut self,
        kind: KeyedKind,
        key: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<usize, StorageError> {
        self.inner.set_key_expiry(kind, key, expire_at).await
    }

    async fn delete_expired(
        &mut self,
        kind: ExpirableKind,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        self.inner.delete_expired(kind, now).await
    }

    async fn commit(self: Box<Self>) -> Result<WriteOutcome, StorageError> {
        let FaultyTransaction { inner, faults } = *self;
        faults.commits.fetch_add(1, Ordering::SeqCst);

        let delay = faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take(&faults.commit_conflicts) {
            // dropping the inner transaction rolls it back
            drop(inner);
            return Ok(WriteOutcome::Conflict);
        }
        inner.commit().await
    }
}
