//! InMemoryStore - 開発・テスト用の参照ストア
//!
//! # 実装詳細
//! - 全テーブルを 1 つの `tokio::sync::Mutex` で保護（直列化可能な分離レベル）
//! - begin() でロックを取得し、テーブルの作業コピーに対して読み書きする
//! - commit() で作業コピーを書き戻す。commit せずに drop すればロールバック
//! - unique 制約・楽観的トークン・外部キーはストア側で検査し、競合は `WriteOutcome::Conflict`
//!
//! 本番用のリレーショナル実装は同じ `Store` trait を別クレートで実装する想定です。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::records::is_expired;
use crate::domain::{
    CounterDelta, CounterId, ExpirableKind, HashField, JobId, JobRecord, JobStateRecord,
    KeyedKind, ListItem, ListItemId, LockRecord, NewJob, QueueEntry, QueueEntryId, SetMember,
    StateChange, StateId, StorageError,
};
use crate::ports::{Store, StoreTransaction, WriteOutcome};

#[derive(Debug, Clone, Default)]
struct Sequences {
    job: i64,
    state: i64,
    queue: i64,
    counter: i64,
    list: i64,
}

fn next(slot: &mut i64) -> i64 {
    *slot += 1;
    *slot
}

#[derive(Debug, Clone, Default)]
struct Tables {
    locks: HashMap<String, LockRecord>,
    jobs: BTreeMap<JobId, JobRecord>,
    job_states: BTreeMap<StateId, JobStateRecord>,
    queue: BTreeMap<QueueEntryId, QueueEntry>,
    counters: BTreeMap<CounterId, CounterDelta>,
    sets: BTreeMap<(String, String), SetMember>,
    lists: BTreeMap<ListItemId, ListItem>,
    hashes: BTreeMap<(String, String), HashField>,
    sequences: Sequences,
}

impl Tables {
    fn delete_jobs(&mut self, ids: &[JobId]) {
        for id in ids {
            self.jobs.remove(id);
        }
        // cascade
        self.job_states.retain(|_, state| !ids.contains(&state.job_id));
        self.queue.retain(|_, entry| !ids.contains(&entry.job_id));
    }
}

/// In-memory store with serializable transactions.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Read-only inspection. Each call waits for the running transaction, if any.

    pub async fn lock_record(&self, resource: &str) -> Option<LockRecord> {
        self.tables.lock().await.locks.get(resource).cloned()
    }

    pub async fn job_record(&self, id: JobId) -> Option<JobRecord> {
        self.tables.lock().await.jobs.get(&id).cloned()
    }

    pub async fn job_count(&self) -> usize {
        self.tables.lock().await.jobs.len()
    }

    pub async fn queue_entries(&self) -> Vec<QueueEntry> {
        self.tables.lock().await.queue.values().cloned().collect()
    }

    pub async fn counter_rows(&self, key: &str) -> Vec<CounterDelta> {
        let tables = self.tables.lock().await;
        tables
            .counters
            .values()
            .filter(|row| row.key == key)
            .cloned()
            .collect()
    }

    /// Logical counter value: the sum of all delta rows.
    pub async fn counter_value(&self, key: &str) -> i64 {
        self.counter_rows(key).await.iter().map(|row| row.value).sum()
    }

    pub async fn set_members(&self, key: &str) -> Vec<SetMember> {
        let tables = self.tables.lock().await;
        tables
            .sets
            .values()
            .filter(|member| member.key == key)
            .cloned()
            .collect()
    }

    /// List values, newest first.
    pub async fn list_values(&self, key: &str) -> Vec<String> {
        let tables = self.tables.lock().await;
        tables
            .lists
            .values()
            .rev()
            .filter(|item| item.key == key)
            .map(|item| item.value.clone())
            .collect()
    }

    pub async fn hash_fields(&self, key: &str) -> Vec<HashField> {
        let tables = self.tables.lock().await;
        tables
            .hashes
            .values()
            .filter(|field| field.key == key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction { guard, staged }))
    }
}

/// Holds the store for its whole lifetime; `staged` is swapped in on commit.
struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn insert_lock(&mut self, lock: &LockRecord) -> Result<WriteOutcome, StorageError> {
        if self.staged.locks.contains_key(&lock.resource) {
            return Ok(WriteOutcome::Conflict);
        }
        self.staged.locks.insert(lock.resource.clone(), lock.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn find_lock(&mut self, resource: &str) -> Result<Option<LockRecord>, StorageError> {
        Ok(self.staged.locks.get(resource).cloned())
    }

    async fn update_lock(
        &mut self,
        resource: &str,
        expected: DateTime<Utc>,
        acquired_at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StorageError> {
        match self.staged.locks.get_mut(resource) {
            Some(lock) if lock.acquired_at == expected => {
                lock.acquired_at = acquired_at;
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn delete_lock(&mut self, resource: &str) -> Result<WriteOutcome, StorageError> {
        match self.staged.locks.remove(resource) {
            Some(_) => Ok(WriteOutcome::Applied),
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn insert_job(&mut self, job: NewJob) -> Result<JobId, StorageError> {
        let id = JobId::new(next(&mut self.staged.sequences.job));
        self.staged.jobs.insert(
            id,
            JobRecord {
                id,
                invocation: job.invocation,
                state_id: None,
                state_name: None,
                created_at: job.created_at,
                expire_at: job.expire_at,
            },
        );
        Ok(id)
    }

    async fn find_job(&mut self, id: JobId) -> Result<Option<JobRecord>, StorageError> {
        Ok(self.staged.jobs.get(&id).cloned())
    }

    async fn update_job(&mut self, job: &JobRecord) -> Result<WriteOutcome, StorageError> {
        match self.staged.jobs.get_mut(&job.id) {
            Some(row) => {
                *row = job.clone();
                Ok(WriteOutcome::Applied)
            }
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn insert_job_state(
        &mut self,
        job_id: JobId,
        state: &StateChange,
        created_at: DateTime<Utc>,
    ) -> Result<StateId, StorageError> {
        if !self.staged.jobs.contains_key(&job_id) {
            return Err(StorageError::Integrity(format!(
                "state `{}` references missing {job_id}",
                state.name
            )));
        }
        let id = StateId::new(next(&mut self.staged.sequences.state));
        self.staged.job_states.insert(
            id,
            JobStateRecord {
                id,
                job_id,
                name: state.name.clone(),
                reason: state.reason.clone(),
                data: state.data.clone(),
                created_at,
            },
        );
        Ok(id)
    }

    async fn job_states(&mut self, job_id: JobId) -> Result<Vec<JobStateRecord>, StorageError> {
        Ok(self
            .staged
            .job_states
            .values()
            .filter(|state| state.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn insert_queue_entry(
        &mut self,
        queue: &str,
        job_id: JobId,
    ) -> Result<QueueEntryId, StorageError> {
        if !self.staged.jobs.contains_key(&job_id) {
            return Err(StorageError::Integrity(format!(
                "queue `{queue}` references missing {job_id}"
            )));
        }
        let id = QueueEntryId::new(next(&mut self.staged.sequences.queue));
        self.staged.queue.insert(
            id,
            QueueEntry {
                id,
                job_id,
                queue: queue.to_string(),
                fetched_at: None,
            },
        );
        Ok(id)
    }

    async fn next_visible_entry(
        &mut self,
        queues: &[String],
        fetched_before: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>, StorageError> {
        Ok(self
            .staged
            .queue
            .values()
            .find(|entry| queues.contains(&entry.queue) && entry.is_visible(fetched_before))
            .cloned())
    }

    async fn update_fetched_at(
        &mut self,
        id: QueueEntryId,
        expected: Option<DateTime<Utc>>,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError> {
        match self.staged.queue.get_mut(&id) {
            Some(entry) if entry.fetched_at == expected => {
                entry.fetched_at = fetched_at;
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn delete_queue_entry(
        &mut self,
        id: QueueEntryId,
        expected: Option<DateTime<Utc>>,
    ) -> Result<WriteOutcome, StorageError> {
        match self.staged.queue.get(&id) {
            Some(entry) if entry.fetched_at == expected => {
                self.staged.queue.remove(&id);
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn insert_counter(
        &mut self,
        key: &str,
        value: i64,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<CounterId, StorageError> {
        let id = CounterId::new(next(&mut self.staged.sequences.counter));
        self.staged.counters.insert(
            id,
            CounterDelta {
                id,
                key: key.to_string(),
                value,
                expire_at,
            },
        );
        Ok(id)
    }

    async fn duplicated_counter_key(&mut self) -> Result<Option<String>, StorageError> {
        let mut rows_per_key: BTreeMap<&str, usize> = BTreeMap::new();
        for row in self.staged.counters.values() {
            *rows_per_key.entry(row.key.as_str()).or_default() += 1;
        }
        Ok(rows_per_key
            .into_iter()
            .find(|(_, rows)| *rows > 1)
            .map(|(key, _)| key.to_string()))
    }

    async fn counter_deltas(
        &mut self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<CounterDelta>, StorageError> {
        Ok(self
            .staged
            .counters
            .values()
            .filter(|row| row.key == key)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_counter(&mut self, id: CounterId) -> Result<WriteOutcome, StorageError> {
        match self.staged.counters.remove(&id) {
            Some(_) => Ok(WriteOutcome::Applied),
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn find_set_member(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<Option<SetMember>, StorageError> {
        Ok(self
            .staged
            .sets
            .get(&(key.to_string(), value.to_string()))
            .cloned())
    }

    async fn insert_set_member(
        &mut self,
        member: &SetMember,
    ) -> Result<WriteOutcome, StorageError> {
        let pk = (member.key.clone(), member.value.clone());
        if self.staged.sets.contains_key(&pk) {
            return Ok(WriteOutcome::Conflict);
        }
        self.staged.sets.insert(pk, member.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn update_set_member(
        &mut self,
        member: &SetMember,
    ) -> Result<WriteOutcome, StorageError> {
        match self
            .staged
            .sets
            .get_mut(&(member.key.clone(), member.value.clone()))
        {
            Some(row) => {
                *row = member.clone();
                Ok(WriteOutcome::Applied)
            }
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn delete_set_member(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<WriteOutcome, StorageError> {
        match self
            .staged
            .sets
            .remove(&(key.to_string(), value.to_string()))
        {
            Some(_) => Ok(WriteOutcome::Applied),
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn insert_list_item(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<ListItemId, StorageError> {
        let id = ListItemId::new(next(&mut self.staged.sequences.list));
        self.staged.lists.insert(
            id,
            ListItem {
                id,
                key: key.to_string(),
                value: value.to_string(),
                expire_at: None,
            },
        );
        Ok(id)
    }

    async fn list_items(&mut self, key: &str) -> Result<Vec<ListItem>, StorageError> {
        Ok(self
            .staged
            .lists
            .values()
            .rev()
            .filter(|item| item.key == key)
            .cloned()
            .collect())
    }

    async fn delete_list_item(&mut self, id: ListItemId) -> Result<WriteOutcome, StorageError> {
        match self.staged.lists.remove(&id) {
            Some(_) => Ok(WriteOutcome::Applied),
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn find_hash_field(
        &mut self,
        key: &str,
        field: &str,
    ) -> Result<Option<HashField>, StorageError> {
        Ok(self
            .staged
            .hashes
            .get(&(key.to_string(), field.to_string()))
            .cloned())
    }

    async fn insert_hash_field(&mut self, field: &HashField) -> Result<WriteOutcome, StorageError> {
        let pk = (field.key.clone(), field.field.clone());
        if self.staged.hashes.contains_key(&pk) {
            return Ok(WriteOutcome::Conflict);
        }
        self.staged.hashes.insert(pk, field.clone());
        Ok(WriteOutcome::Applied)
    }

    async fn update_hash_field(&mut self, field: &HashField) -> Result<WriteOutcome, StorageError> {
        match self
            .staged
            .hashes
            .get_mut(&(field.key.clone(), field.field.clone()))
        {
            Some(row) => {
                *row = field.clone();
                Ok(WriteOutcome::Applied)
            }
            None => Ok(WriteOutcome::Conflict),
        }
    }

    async fn delete_key(&mut self, kind: KeyedKind, key: &str) -> Result<usize, StorageError> {
        let tables = &mut self.staged;
        let removed = match kind {
            KeyedKind::Hash => {
                let before = tables.hashes.len();
                tables.hashes.retain(|(k, _), _| k != key);
                before - tables.hashes.len()
            }
            KeyedKind::List => {
                let before = tables.lists.len();
                tables.lists.retain(|_, item| item.key != key);
                before - tables.lists.len()
            }
            KeyedKind::Set => {
                let before = tables.sets.len();
                tables.sets.retain(|(k, _), _| k != key);
                before - tables.sets.len()
            }
        };
        Ok(removed)
    }

    async fn set_key_expiry(
        &mut self,
        kind: KeyedKind,
        key: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<usize, StorageError> {
        let tables = &mut self.staged;
        let mut touched = 0;
        match kind {
            KeyedKind::Hash => {
                for field in tables.hashes.values_mut().filter(|f| f.key == key) {
                    field.expire_at = expire_at;
                    touched += 1;
                }
            }
            KeyedKind::List => {
                for item in tables.lists.values_mut().filter(|i| i.key == key) {
                    item.expire_at = expire_at;
                    touched += 1;
                }
            }
            KeyedKind::Set => {
                for member in tables.sets.values_mut().filter(|m| m.key == key) {
                    member.expire_at = expire_at;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn delete_expired(
        &mut self,
        kind: ExpirableKind,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let tables = &mut self.staged;
        let removed = match kind {
            ExpirableKind::Counter => {
                let before = tables.counters.len();
                tables.counters.retain(|_, row| !is_expired(row.expire_at, now));
                before - tables.counters.len()
            }
            ExpirableKind::Job => {
                let expired: Vec<JobId> = tables
                    .jobs
                    .values()
                    .filter(|job| is_expired(job.expire_at, now))
                    .map(|job| job.id)
                    .collect();
                tables.delete_jobs(&expired);
                expired.len()
            }
            ExpirableKind::List => {
                let before = tables.lists.len();
                tables.lists.retain(|_, item| !is_expired(item.expire_at, now));
                before - tables.lists.len()
            }
            ExpirableKind::Set => {
                let before = tables.sets.len();
                tables.sets.retain(|_, member| !is_expired(member.expire_at, now));
                before - tables.sets.len()
            }
            ExpirableKind::Hash => {
                let before = tables.hashes.len();
                tables.hashes.retain(|_, field| !is_expired(field.expire_at, now));
                before - tables.hashes.len()
            }
        };
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<WriteOutcome, StorageError> {
        let InMemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(WriteOutcome::Applied)
    }
}
