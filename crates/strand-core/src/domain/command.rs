//! Command - WriteTransaction に積まれる論理的な変更
//!
//! クロージャではなくデータとして表現することで、
//! - コミット時にストアへ解釈適用できる
//! - 競合時に同じ列を新しいトランザクションで再生できる
//! - ストア実装なしでもテストできる

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::records::{KeyedKind, StateChange};

/// One deferred mutation, applied in append order at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    ExpireJob {
        job_id: JobId,
        expire_in: Duration,
    },
    PersistJob {
        job_id: JobId,
    },
    /// Record a new state and make it the job's current one.
    SetJobState {
        job_id: JobId,
        state: StateChange,
    },
    /// Record a state in the history without changing the current one.
    AddJobState {
        job_id: JobId,
        state: StateChange,
    },
    AddToQueue {
        queue: String,
        job_id: JobId,
    },
    AdjustCounter {
        key: String,
        delta: i64,
        expire_in: Option<Duration>,
    },
    AddToSet {
        key: String,
        value: String,
        score: f64,
    },
    AddRangeToSet {
        key: String,
        values: Vec<String>,
    },
    RemoveFromSet {
        key: String,
        value: String,
    },
    RemoveSet {
        key: String,
    },
    InsertToList {
        key: String,
        value: String,
    },
    RemoveFromList {
        key: String,
        value: String,
    },
    /// Keep items `keep_start..=keep_end` counted from the newest item.
    TrimList {
        key: String,
        keep_start: i64,
        keep_end: i64,
    },
    SetRangeInHash {
        key: String,
        fields: Vec<(String, String)>,
    },
    RemoveHash {
        key: String,
    },
    ExpireKey {
        kind: KeyedKind,
        key: String,
        expire_in: Duration,
    },
    PersistKey {
        kind: KeyedKind,
        key: String,
    },
}

impl Command {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ExpireJob { .. } => "expire_job",
            Command::PersistJob { .. } => "persist_job",
            Command::SetJobState { .. } => "set_job_state",
            Command::AddJobState { .. } => "add_job_state",
            Command::AddToQueue { .. } => "add_to_queue",
            Command::AdjustCounter { .. } => "adjust_counter",
            Command::AddToSet { .. } => "add_to_set",
            Command::AddRangeToSet { .. } => "add_range_to_set",
            Command::RemoveFromSet { .. } => "remove_from_set",
            Command::RemoveSet { .. } => "remove_set",
            Command::InsertToList { .. } => "insert_to_list",
            Command::RemoveFromList { .. } => "remove_from_list",
            Command::TrimList { .. } => "trim_list",
            Command::SetRangeInHash { .. } => "set_range_in_hash",
            Command::RemoveHash { .. } => "remove_hash",
            Command::ExpireKey { .. } => "expire_key",
            Command::PersistKey { .. } => "persist_key",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_with_op_tag() {
        let cmd = Command::AddToSet {
            key: "recurring-jobs".into(),
            value: "nightly".into(),
            score: 1.5,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "add_to_set");
        assert_eq!(json["key"], "recurring-jobs");

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn keyed_kind_uses_snake_case() {
        let cmd = Command::PersistKey {
            kind: KeyedKind::Hash,
            key: "h".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "hash");
        assert_eq!(cmd.name(), "persist_key");
    }
}
