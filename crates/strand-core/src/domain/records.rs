//! Rows owned by the shared store.
//!
//! Design:
//! - Every struct here mirrors one table row; none of them is owned by an in-process actor.
//! - Mutable rows carry their optimistic concurrency token as a plain field
//!   (`LockRecord::acquired_at`, `QueueEntry::fetched_at`).
//! - `expire_at == None` always means "never expires".

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CounterId, JobId, ListItemId, QueueEntryId, StateId};

/// A held named lock. Absence of the row means unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(resource: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            resource: resource.into(),
            acquired_at,
        }
    }

    /// Has the lease of this lock run out at `now`?
    pub fn is_expired(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        offset(self.acquired_at, lease).is_some_and(|expires| expires <= now)
    }
}

/// One queue entry referencing a job.
///
/// `fetched_at == None` means visible; `Some(_)` means claimed by a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub job_id: JobId,
    pub queue: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Can a dequeuer claim this entry, given claims older than `fetched_before` are stale?
    pub fn is_visible(&self, fetched_before: DateTime<Utc>) -> bool {
        match self.fetched_at {
            None => true,
            Some(fetched_at) => fetched_at < fetched_before,
        }
    }
}

/// One append-only counter delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub id: CounterId,
    pub key: String,
    pub value: i64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Background job row. The invocation payload is opaque to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub invocation: serde_json::Value,
    pub state_id: Option<StateId>,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Fields of a job row before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub invocation: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
}

/// One entry in a job's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub id: StateId,
    pub job_id: JobId,
    pub name: String,
    pub reason: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A state a job is moved into, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub name: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StateChange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Member of a scored set. `(key, value)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetMember {
    pub key: String,
    pub value: String,
    pub score: f64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Item of a list. Newer items have larger ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: ListItemId,
    pub key: String,
    pub value: String,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Field of a hash. `(key, field)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashField {
    pub key: String,
    pub field: String,
    pub value: String,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Key-addressed aggregates that can be expired or removed as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyedKind {
    Hash,
    List,
    Set,
}

/// Every record kind the expiration sweeper visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirableKind {
    Counter,
    Job,
    List,
    Set,
    Hash,
}

impl ExpirableKind {
    pub const ALL: [ExpirableKind; 5] = [
        ExpirableKind::Counter,
        ExpirableKind::Job,
        ExpirableKind::List,
        ExpirableKind::Set,
        ExpirableKind::Hash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExpirableKind::Counter => "counter",
            ExpirableKind::Job => "job",
            ExpirableKind::List => "list",
            ExpirableKind::Set => "set",
            ExpirableKind::Hash => "hash",
        }
    }
}

impl From<KeyedKind> for ExpirableKind {
    fn from(kind: KeyedKind) -> Self {
        match kind {
            KeyedKind::Hash => ExpirableKind::Hash,
            KeyedKind::List => ExpirableKind::List,
            KeyedKind::Set => ExpirableKind::Set,
        }
    }
}

/// `at + by`, or `None` when the result is not representable.
pub fn offset(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
}

/// Claims made before the returned instant are stale at `now`.
pub fn stale_before(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Is a row with this expiry due for removal at `now`?
pub fn is_expired(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expire_at, Some(at) if at < now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[rstest]
    #[case::never(None, false)]
    #[case::past(Some(at(-1)), true)]
    #[case::future(Some(at(1)), false)]
    #[case::exactly_now(Some(at(0)), false)]
    fn expiry_is_strictly_before_now(
        #[case] expire_at: Option<DateTime<Utc>>,
        #[case] expected: bool,
    ) {
        assert_eq!(is_expired(expire_at, at(0)), expected);
    }

    #[test]
    fn lock_expires_after_lease() {
        let lock = LockRecord::new("res", at(0));
        assert!(!lock.is_expired(Duration::from_secs(10), at(9)));
        assert!(lock.is_expired(Duration::from_secs(10), at(10)));
    }

    #[test]
    fn offsets_saturate_instead_of_panicking() {
        assert_eq!(offset(at(0), Duration::from_secs(5)), Some(at(5)));
        assert_eq!(offset(at(0), Duration::MAX), None);
        assert_eq!(stale_before(at(10), Duration::from_secs(4)), at(6));
        assert_eq!(stale_before(at(0), Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn queue_entry_visibility() {
        let mut entry = QueueEntry {
            id: QueueEntryId::new(1),
            job_id: JobId::new(1),
            queue: "default".into(),
            fetched_at: None,
        };
        assert!(entry.is_visible(at(0)));

        entry.fetched_at = Some(at(5));
        assert!(!entry.is_visible(at(0)));
        assert!(entry.is_visible(at(6)));
    }
}
