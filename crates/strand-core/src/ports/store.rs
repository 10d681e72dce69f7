//! Store port - トランザクショナルなリレーショナルストアとの境界
//!
//! このクレートの安全性はすべてストアの競合検出に委ねられています：
//! - unique 制約（ロック行・セットメンバー・ハッシュフィールド）
//! - 楽観的トークン付きの update/delete（acquired_at, fetched_at）
//! - ローカルトランザクションによる複数行のアトミックなコミット
//!
//! # 競合の扱い
//! 競合はエラーではなく `WriteOutcome::Conflict` として返します。
//! 呼び出し側は必ず「リトライ」か「負けたので no-op」のどちらかに分岐します。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    CounterDelta, CounterId, ExpirableKind, HashField, JobId, JobRecord, JobStateRecord,
    KeyedKind, ListItem, ListItemId, LockRecord, NewJob, QueueEntry, QueueEntryId, SetMember,
    StateChange, StateId, StorageError,
};

/// Result of a write whose precondition the store checks.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was staged (or, for `commit`, made durable).
    Applied,
    /// A unique key already existed, or the guarded row changed or vanished.
    Conflict,
}

impl WriteOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// Entry point to the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begin a native transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError>;
}

/// One native transaction.
///
/// Reads observe writes staged earlier in the same transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    // --- locks ---

    async fn insert_lock(&mut self, lock: &LockRecord) -> Result<WriteOutcome, StorageError>;

    async fn find_lock(&mut self, resource: &str) -> Result<Option<LockRecord>, StorageError>;

    /// Set `acquired_at`, guarded by the previously read `expected` value.
    async fn update_lock(
        &mut self,
        resource: &str,
        expected: DateTime<Utc>,
        acquired_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StorageError>;

    async fn delete_lock(&mut self, resource: &str) -> Result<WriteOutcome, StorageError>;

    // --- jobs ---

    async fn insert_job(&mut self, job: NewJob) -> Result<JobId, StorageError>;

    async fn find_job(&mut self, id: JobId) -> Result<Option<JobRecord>, StorageError>;

    /// Overwrite a job row; `Conflict` when it no longer exists.
    async fn update_job(&mut self, job: &JobRecord) -> Result<WriteOutcome, StorageError>;

    /// Append to a job's state history. Fails with `Integrity` for a missing job.
    async fn insert_job_state(
        &mut self,
        job_id: JobId,
        state: &StateChange,
        created_at: DateTime<Utc>,
    ) -> Result<StateId, StorageError>;

    async fn job_states(&mut self, job_id: JobId) -> Result<Vec<JobStateRecord>, StorageError>;

    // --- queue ---

    /// Fails with `Integrity` when `job_id` does not reference a job.
    async fn insert_queue_entry(
        &mut self,
        queue: &str,
        job_id: JobId,
    ) -> Result<QueueEntryId, StorageError>;

    /// Smallest-id entry among `queues` that is unclaimed or was claimed before `fetched_before`.
    async fn next_visible_entry(
        &mut self,
        queues: &[String],
        fetched_before: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StorageError>;

    async fn update_fetched_at(
        &mut self,
        id: QueueEntryId,
        expected: Option<DateTime<Utc>>,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError>;

    async fn delete_queue_entry(
        &mut self,
        id: QueueEntryId,
        expected: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError>;

    // --- counters ---

    async fn insert_counter(
        &mut self,
        key: &str,
        value: i64,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<CounterId, StorageError>;

    /// Any key that currently has more than one delta row.
    async fn duplicated_counter_key(&mut self) -> Result<Option<String>, StorageError>;

    /// Up to `limit` delta rows of `key`, oldest first.
    async fn counter_deltas(
        &mut self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<CounterDelta>, StorageError>;

    async fn delete_counter(&mut self, id: CounterId) -> Result<WriteOutcome, StorageError>;

    // --- sets ---

    async fn find_set_member(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<Option<SetMember>, StorageError>;

    async fn insert_set_member(&mut self, member: &SetMember)
    -> Result<WriteOutcome, StorageError>;

    async fn update_set_member(&mut self, member: &SetMember)
    -> Result<WriteOutcome, StorageError>;

    async fn delete_set_member(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<WriteOutcome, StorageError>;

    // --- lists ---

    async fn insert_list_item(&mut self, key: &str, value: &str)
    -> Result<ListItemId, StorageError>;

    /// Items of `key`, newest first.
    async fn list_items(&mut self, key: &str) -> Result<Vec<ListItem>, StorageError>;

    async fn delete_list_item(&mut self, id: ListItemId) -> Result<WriteOutcome, StorageError>;

    // --- hashes ---

    async fn find_hash_field(
        &mut self,
        key: &str,
        field: &str,
    ) -> Result<Option<HashField>, StorageError>;

    async fn insert_hash_field(&mut self, field: &HashField) -> Result<WriteOutcome, StorageError>;

    async fn update_hash_field(&mut self, field: &HashField) -> Result<WriteOutcome, StorageError>;

    // --- keyed aggregates ---

    /// Delete every row of a hash/list/set; returns the number removed.
    async fn delete_key(&mut self, kind: KeyedKind, key: &str) -> Result<usize, StorageError>;

    /// Set `expire_at` on every row of a hash/list/set; returns the number touched.
    async fn set_key_expiry(
        &mut self,
        kind: KeyedKind,
        key: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<usize, StorageError>;

    // --- expiration ---

    /// Delete rows of `kind` whose `expire_at` is set and earlier than `now`.
    async fn delete_expired(
        &mut self,
        kind: ExpirableKind,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    /// Make every staged write durable at once.
    async fn commit(self: Box<Self>) -> Result<WriteOutcome, StorageError>;
}
