//! Domain identifiers (strongly-typed IDs).
//!
//! # ストア採番の整数 ID + ジェネリック実装
//! ID はすべてストアの単調増加シーケンスから採番されます。
//! キューの FIFO 順序は `QueueEntryId` の大小そのものなので、
//! ID は比較可能（`Ord`）でなければなりません。
//!
//! ## Phantom Type パターン
//! `Id<T>` で共通実装を提供しつつ、`T` は実行時には使わないマーカー型として
//! コンパイル時の型安全性を提供します（`JobId` と `QueueEntryId` は混同できない）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "queue-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    value: i64,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

impl<T: IdMarker> From<i64> for Id<T> {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {}

impl IdMarker for JobState {
    fn prefix() -> &'static str {
        "state-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueEntry {}

impl IdMarker for QueueEntry {
    fn prefix() -> &'static str {
        "queue-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {}

impl IdMarker for Counter {
    fn prefix() -> &'static str {
        "counter-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListItem {}

impl IdMarker for ListItem {
    fn prefix() -> &'static str {
        "list-"
    }
}

// ========================================
// Type Alias
// ========================================

/// Identifier of a background job row.
pub type JobId = Id<Job>;

/// Identifier of one recorded job state transition.
pub type StateId = Id<JobState>;

/// Identifier of a queue entry; insertion order within the store.
pub type QueueEntryId = Id<QueueEntry>;

/// Identifier of one counter delta row.
pub type CounterId = Id<Counter>;

/// Identifier of one list item row.
pub type ListItemId = Id<ListItem>;
