//! WriteTransaction - 遅延実行される変更のバッチ
//!
//! # 設計
//! - 変更はクロージャではなく `Command`（データ）として積む
//! - commit() で 1 つのネイティブトランザクションを開き、積んだ順に 1 件ずつ適用
//!   （後のコマンドは同じバッチ内の前のコマンドの結果を観測できる）
//! - どれか 1 つでもエラーならトランザクションごと破棄され、何も残らない
//! - after-commit コールバック（dequeue の起床など）はコミット成功後にだけ実行
//! - コミット自体が競合した場合はコマンド列を新しいトランザクションで再生する

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::queue::QueueSignal;
use crate::domain::errors::require_name;
use crate::domain::records::offset;
use crate::domain::{
    Command, HashField, JobId, JobRecord, KeyedKind, SetMember, StateChange,
    StorageError,
};
use crate::ports::{Clock, Store, StoreTransaction, WriteOutcome};

/// How often a conflicting commit is replayed before giving up.
pub(crate) const MAX_COMMIT_ATTEMPTS: usize = 5;

type AfterCommit = Box<dyn FnOnce() + Send>;

/// An ordered batch of mutations committed atomically.
///
/// Dropping it (or calling [`WriteTransaction::discard`]) before `commit`
/// throws the batch away; nothing reaches the store until then.
pub struct WriteTransaction {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    signal: Arc<QueueSignal>,
    commands: Vec<Command>,
    after_commit: Vec<AfterCommit>,
    wakes_dequeuers: bool,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("commands", &self.commands)
            .field("after_commit", &self.after_commit.len())
            .finish_non_exhaustive()
    }
}

impl WriteTransaction {
    pub(crate) fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, signal: Arc<QueueSignal>) -> Self {
        Self {
            store,
            clock,
            signal,
            commands: Vec::new(),
            after_commit: Vec::new(),
            wakes_dequeuers: false,
        }
    }

    // --- jobs ---

    pub fn expire_job(&mut self, job_id: JobId, expire_in: Duration) -> Result<&mut Self, StorageError> {
        self.push(Command::ExpireJob { job_id, expire_in })
    }

    pub fn persist_job(&mut self, job_id: JobId) -> Result<&mut Self, StorageError> {
        self.push(Command::PersistJob { job_id })
    }

    pub fn set_job_state(&mut self, job_id: JobId, state: StateChange) -> Result<&mut Self, StorageError> {
        self.push(Command::SetJobState { job_id, state })
    }

    pub fn add_job_state(&mut self, job_id: JobId, state: StateChange) -> Result<&mut Self, StorageError> {
        self.push(Command::AddJobState { job_id, state })
    }

    pub fn add_to_queue(&mut self, queue: &str, job_id: JobId) -> Result<&mut Self, StorageError> {
        self.push(Command::AddToQueue {
            queue: queue.to_string(),
            job_id,
        })
    }

    // --- counters ---

    pub fn increment_counter(&mut self, key: &str) -> Result<&mut Self, StorageError> {
        self.adjust_counter(key, 1, None)
    }

    pub fn increment_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<&mut Self, StorageError> {
        self.adjust_counter(key, 1, Some(expire_in))
    }

    pub fn decrement_counter(&mut self, key: &str) -> Result<&mut Self, StorageError> {
        self.adjust_counter(key, -1, None)
    }

    pub fn decrement_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<&mut Self, StorageError> {
        self.adjust_counter(key, -1, Some(expire_in))
    }

    pub fn adjust_counter(
        &mut self,
        key: &str,
        delta: i64,
        expire_in: Option<Duration>,
    ) -> Result<&mut Self, StorageError> {
        self.push(Command::AdjustCounter {
            key: key.to_string(),
            delta,
            expire_in,
        })
    }

    // --- sets ---

    pub fn add_to_set(&mut self, key: &str, value: &str) -> Result<&mut Self, StorageError> {
        self.add_to_set_with_score(key, value, 0.0)
    }

    pub fn add_to_set_with_score(
        &mut self,
        key: &str,
        value: &str,
        score: f64,
    ) -> Result<&mut Self, StorageError> {
        self.push(Command::AddToSet {
            key: key.to_string(),
            value: value.to_string(),
            score,
        })
    }

    pub fn add_range_to_set<I, S>(&mut self, key: &str, values: I) -> Result<&mut Self, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Command::AddRangeToSet {
            key: key.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) -> Result<&mut Self, StorageError> {
        self.push(Command::RemoveFromSet {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn remove_set(&mut self, key: &str) -> Result<&mut Self, StorageError> {
        self.push(Command::RemoveSet { key: key.to_string() })
    }

    // --- lists ---

    pub fn insert_to_list(&mut self, key: &str, value: &str) -> Result<&mut Self, StorageError> {
        self.push(Command::InsertToList {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn remove_from_list(&mut self, key: &str, value: &str) -> Result<&mut Self, StorageError> {
        self.push(Command::RemoveFromList {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Keep items `keep_start..=keep_end`, counted from the newest item.
    pub fn trim_list(&mut self, key: &str, keep_start: i64, keep_end: i64) -> Result<&mut Self, StorageError> {
        self.push(Command::TrimList {
            key: key.to_string(),
            keep_start,
            keep_end,
        })
    }

    // --- hashes ---

    pub fn set_range_in_hash<I, F, V>(&mut self, key: &str, fields: I) -> Result<&mut Self, StorageError>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        self.push(Command::SetRangeInHash {
            key: key.to_string(),
            fields: fields
                .into_iter()
                .map(|(field, value)| (field.into(), value.into()))
                .collect(),
        })
    }

    pub fn remove_hash(&mut self, key: &str) -> Result<&mut Self, StorageError> {
        self.push(Command::RemoveHash { key: key.to_string() })
    }

    // --- keyed expiry ---

    pub fn expire_key(&mut self, kind: KeyedKind, key: &str, expire_in: Duration) -> Result<&mut Self, StorageError> {
        self.push(Command::ExpireKey {
            kind,
            key: key.to_string(),
            expire_in,
        })
    }

    pub fn persist_key(&mut self, kind: KeyedKind, key: &str) -> Result<&mut Self, StorageError> {
        self.push(Command::PersistKey {
            kind,
            key: key.to_string(),
        })
    }

    /// Append an already-built command.
    pub fn push(&mut self, command: Command) -> Result<&mut Self, StorageError> {
        validate(&command)?;
        if matches!(command, Command::AddToQueue { .. }) && !self.wakes_dequeuers {
            self.wakes_dequeuers = true;
            let signal = Arc::clone(&self.signal);
            self.after_commit.push(Box::new(move || signal.notify()));
        }
        self.commands.push(command);
        Ok(self)
    }

    /// Run `callback` once the batch is durable. Never runs if the commit fails.
    pub fn after_commit(&mut self, callback: impl FnOnce() + Send + 'static) -> &mut Self {
        self.after_commit.push(Box::new(callback));
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop the batch without touching the store.
    pub fn discard(self) {
        debug!(commands = self.commands.len(), "write transaction discarded");
    }

    /// Apply every command in one native transaction.
    pub async fn commit(mut self) -> Result<(), StorageError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            for command in &self.commands {
                apply(&mut *tx, command, now).await?;
            }
            match tx.commit().await? {
                WriteOutcome::Applied => {
                    debug!(commands = self.commands.len(), attempt, "write transaction committed");
                    for callback in self.after_commit.drain(..) {
                        callback();
                    }
                    return Ok(());
                }
                WriteOutcome::Conflict => {
                    debug!(attempt, "write transaction conflicted; replaying");
                }
            }
        }
        Err(StorageError::Store(format!(
            "write transaction conflicted {MAX_COMMIT_ATTEMPTS} times"
        )))
    }
}

fn validate(command: &Command) -> Result<(), StorageError> {
    match command {
        Command::ExpireJob { .. } | Command::PersistJob { .. } => Ok(()),
        Command::SetJobState { state, .. } | Command::AddJobState { state, .. } => {
            require_name("state", &state.name)
        }
        Command::AddToQueue { queue, .. } => require_name("queue", queue),
        Command::AddRangeToSet { key, values } => {
            require_name("key", key)?;
            values.iter().try_for_each(|value| require_name("value", value))
        }
        Command::SetRangeInHash { key, fields } => {
            require_name("key", key)?;
            fields.iter().try_for_each(|(field, _)| require_name("field", field))
        }
        Command::AdjustCounter { key, .. }
        | Command::AddToSet { key, .. }
        | Command::RemoveFromSet { key, .. }
        | Command::RemoveSet { key }
        | Command::InsertToList { key, .. }
        | Command::RemoveFromList { key, .. }
        | Command::TrimList { key, .. }
        | Command::RemoveHash { key }
        | Command::ExpireKey { key, .. }
        | Command::PersistKey { key, .. } => require_name("key", key),
    }
}

/// A guarded write lost to a concurrent change; the store's row stands.
fn tolerate(outcome: WriteOutcome, command: &Command) {
    if outcome == WriteOutcome::Conflict {
        debug!(command = command.name(), "row changed concurrently; store wins");
    }
}

async fn load_job(tx: &mut dyn StoreTransaction, job_id: JobId) -> Result<JobRecord, StorageError> {
    tx.find_job(job_id)
        .await?
        .ok_or_else(|| StorageError::Integrity(format!("{job_id} does not exist")))
}

async fn apply(
    tx: &mut dyn StoreTransaction,
    command: &Command,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    match command {
        Command::ExpireJob { job_id, expire_in } => {
            let mut job = load_job(tx, *job_id).await?;
            job.expire_at = offset(now, *expire_in);
            tolerate(tx.update_job(&job).await?, command);
        }
        Command::PersistJob { job_id } => {
            let mut job = load_job(tx, *job_id).await?;
            job.expire_at = None;
            tolerate(tx.update_job(&job).await?, command);
        }
        Command::SetJobState { job_id, state } => {
            let state_id = tx.insert_job_state(*job_id, state, now).await?;
            let mut job = load_job(tx, *job_id).await?;
            job.state_id = Some(state_id);
            job.state_name = Some(state.name.clone());
            tolerate(tx.update_job(&job).await?, command);
        }
        Command::AddJobState { job_id, state } => {
            tx.insert_job_state(*job_id, state, now).await?;
        }
        Command::AddToQueue { queue, job_id } => {
            tx.insert_queue_entry(queue, *job_id).await?;
        }
        Command::AdjustCounter {
            key,
            delta,
            expire_in,
        } => {
            let expire_at = expire_in.and_then(|expire_in| offset(now, expire_in));
            tx.insert_counter(key, *delta, expire_at).await?;
        }
        Command::AddToSet { key, value, score } => {
            merge_set_member(tx, key, value, *score, command).await?;
        }
        Command::AddRangeToSet { key, values } => {
            for value in values {
                merge_set_member(tx, key, value, 0.0, command).await?;
            }
        }
        Command::RemoveFromSet { key, value } => {
            tolerate(tx.delete_set_member(key, value).await?, command);
        }
        Command::RemoveSet { key } => {
            tx.delete_key(KeyedKind::Set, key).await?;
        }
        Command::InsertToList { key, value } => {
            tx.insert_list_item(key, value).await?;
        }
        Command::RemoveFromList { key, value } => {
            for item in tx.list_items(key).await? {
                if &item.value == value {
                    tolerate(tx.delete_list_item(item.id).await?, command);
                }
            }
        }
        Command::TrimList {
            key,
            keep_start,
            keep_end,
        } => {
            let items = tx.list_items(key).await?;
            for (index, item) in (0_i64..).zip(items) {
                if index < *keep_start || index > *keep_end {
                    tolerate(tx.delete_list_item(item.id).await?, command);
                }
            }
        }
        Command::SetRangeInHash { key, fields } => {
            for (field, value) in fields {
                merge_hash_field(tx, key, field, value, command).await?;
            }
        }
        Command::RemoveHash { key } => {
            tx.delete_key(KeyedKind::Hash, key).await?;
        }
        Command::ExpireKey {
            kind,
            key,
            expire_in,
        } => {
            tx.set_key_expiry(*kind, key, offset(now, *expire_in)).await?;
        }
        Command::PersistKey { kind, key } => {
            tx.set_key_expiry(*kind, key, None).await?;
        }
    }
    Ok(())
}

/// Update the member if it exists (persisted or staged earlier in this batch), else insert.
async fn merge_set_member(
    tx: &mut dyn StoreTransaction,
    key: &str,
    value: &str,
    score: f64,
    command: &Command,
) -> Result<(), StorageError> {
    let outcome = match tx.find_set_member(key, value).await? {
        Some(existing) => {
            tx.update_set_member(&SetMember { score, ..existing }).await?
        }
        None => {
            tx.insert_set_member(&SetMember {
                key: key.to_string(),
                value: value.to_string(),
                score,
                expire_at: None,
            })
            .await?
        }
    };
    tolerate(outcome, command);
    Ok(())
}

async fn merge_hash_field(
    tx: &mut dyn StoreTransaction,
    key: &str,
    field: &str,
    value: &str,
    command: &Command,
) -> Result<(), StorageError> {
    let outcome = match tx.find_hash_field(key, field).await? {
        Some(existing) => {
            tx.update_hash_field(&HashField {
                value: value.to_string(),
                ..existing
            })
            .await?
        }
        None => {
            tx.insert_hash_field(&HashField {
                key: key.to_string(),
                field: field.to_string(),
                value: value.to_string(),
                expire_at: None,
            })
            .await?
        }
    };
    tolerate(outcome, command);
    Ok(())
}
