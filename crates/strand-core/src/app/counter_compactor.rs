//! CounterCompactor - 同じキーのカウンター行を 1 行にまとめる定期処理
//!
//! 1 バッチ = 1 トランザクション：
//! 最大 100 行を削除し、合計値と最大の expire_at を持つ 1 行を挿入する。
//! 別インスタンスと競合したバッチは諦め、次の反復で選び直す（リトライしない）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::{BackgroundProcess, pause};
use crate::domain::StorageError;
use crate::ports::{Store, WriteOutcome};

pub const COMPACTION_BATCH_SIZE: usize = 100;

/// What one compaction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub batches: usize,
    pub rows_merged: usize,
    pub conflicts: usize,
}

enum Batch {
    NothingToDo,
    Merged(usize),
    Conflicted,
}

pub struct CounterCompactor {
    store: Arc<dyn Store>,
    interval: Duration,
}

impl CounterCompactor {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Merge until no key has more than one row.
    pub async fn compact(&self, cancel: &CancellationToken) -> Result<CompactionReport, StorageError> {
        let mut report = CompactionReport::default();
        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match self.compact_batch().await? {
                Batch::NothingToDo => return Ok(report),
                Batch::Merged(rows) => {
                    report.batches += 1;
                    report.rows_merged += rows;
                }
                Batch::Conflicted => report.conflicts += 1,
            }
        }
    }

    async fn compact_batch(&self) -> Result<Batch, StorageError> {
        let mut tx = self.store.begin().await?;
        let Some(key) = tx.duplicated_counter_key().await? else {
            return Ok(Batch::NothingToDo);
        };
        let rows = tx.counter_deltas(&key, COMPACTION_BATCH_SIZE).await?;

        // the rows stay as they are when their sum does not fit
        let Some(value) = rows.iter().try_fold(0i64, |sum, row| sum.checked_add(row.value)) else {
            return Err(StorageError::Integrity(format!(
                "counter `{key}` overflows i64; {} rows left unmerged",
                rows.len()
            )));
        };
        // None sorts first, so rows without an expiry never win
        let expire_at = rows.iter().map(|row| row.expire_at).max().flatten();
        for row in &rows {
            if !tx.delete_counter(row.id).await?.is_applied() {
                debug!(key = %key, counter_id = %row.id, "counter row already merged elsewhere");
                return Ok(Batch::Conflicted);
            }
        }
        tx.insert_counter(&key, value, expire_at).await?;

        match tx.commit().await? {
            WriteOutcome::Applied => {
                debug!(key = %key, rows = rows.len(), value, "counter rows merged");
                Ok(Batch::Merged(rows.len()))
            }
            WriteOutcome::Conflict => Ok(Batch::Conflicted),
        }
    }
}

#[async_trait]
impl BackgroundProcess for CounterCompactor {
    fn name(&self) -> &'static str {
        "counter-compactor"
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), StorageError> {
        let report = self.compact(cancel).await?;
        if report.batches > 0 || report.conflicts > 0 {
            info!(
                batches = report.batches,
                rows_merged = report.rows_merged,
                conflicts = report.conflicts,
                "counter compaction pass finished"
            );
        }
        pause(cancel, self.interval).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{FaultyStore, InMemoryStore};
    use chrono::{TimeZone, Utc};

    async fn insert_rows(store: &InMemoryStore, rows: &[(&str, i64)]) {
        let mut tx = store.begin().await.unwrap();
        for (key, value) in rows {
            tx.insert_counter(key, *value, None).await.unwrap();
        }
        assert!(tx.commit().await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn compaction_preserves_every_sum() {
        let store = InMemoryStore::new();
        insert_rows(&store, &[("c1", 1); 10]).await;
        insert_rows(&store, &[("c2", -1); 20]).await;
        insert_rows(&store, &[("c3", 20); 5]).await;
        insert_rows(&store, &[("c3", -1)]).await;

        let compactor = CounterCompactor::new(Arc::new(store.clone()), Duration::from_secs(60));
        let report = compactor.compact(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.batches, 3);
        assert_eq!(report.rows_merged, 36);

        for (key, expected) in [("c1", 10), ("c2", -20), ("c3", 99)] {
            let rows = store.counter_rows(key).await;
            assert_eq!(rows.len(), 1, "{key} should be a single row");
            assert_eq!(rows[0].value, expected);
        }
    }

    #[tokio::test]
    async fn large_keys_are_merged_in_batches() {
        let store = InMemoryStore::new();
        insert_rows(&store, &[("big", 1); 250]).await;

        let compactor = CounterCompactor::new(Arc::new(store.clone()), Duration::from_secs(60));
        let report = compactor.compact(&CancellationToken::new()).await.unwrap();
        assert!(report.batches >= 3);

        let rows = store.counter_rows("big").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 250);
    }

    #[tokio::test]
    async fn merged_row_keeps_the_latest_expiry() {
        let store = InMemoryStore::new();
        let early = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_counter("k", 2, Some(early)).await.unwrap();
        tx.insert_counter("k", 3, None).await.unwrap();
        tx.insert_counter("k", 4, Some(late)).await.unwrap();
        assert!(tx.commit().await.unwrap().is_applied());

        let compactor = CounterCompactor::new(Arc::new(store.clone()), Duration::from_secs(60));
        compactor.compact(&CancellationToken::new()).await.unwrap();

        let rows = store.counter_rows("k").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 9);
        assert_eq!(rows[0].expire_at, Some(late));
    }

    #[tokio::test]
    async fn conflicted_batch_is_dropped_and_selected_again() {
        let store = InMemoryStore::new();
        insert_rows(&store, &[("c1", 1); 10]).await;
        insert_rows(&store, &[("c2", -3); 4]).await;

        let faulty = FaultyStore::new(store.clone());
        faulty.conflict_next_commits(1);
        let compactor = CounterCompactor::new(Arc::new(faulty.clone()), Duration::from_secs(60));
        let report = compactor.compact(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.batches, 2);
        assert_eq!(report.rows_merged, 14);
        // two merges, the conflicted attempt, and the final empty look
        assert_eq!(faulty.begins(), 4);

        for (key, expected) in [("c1", 10), ("c2", -12)] {
            let rows = store.counter_rows(key).await;
            assert_eq!(rows.len(), 1, "{key} should be a single row");
            assert_eq!(rows[0].value, expected);
        }
    }

    #[tokio::test]
    async fn overflowing_sum_leaves_the_rows_untouched() {
        let store = InMemoryStore::new();
        insert_rows(&store, &[("huge", i64::MAX), ("huge", 1)]).await;

        let compactor = CounterCompactor::new(Arc::new(store.clone()), Duration::from_secs(60));
        let err = compactor.compact(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Integrity(ref message) if message.contains("huge")));

        let values: Vec<i64> = store.counter_rows("huge").await.iter().map(|row| row.value).collect();
        assert_eq!(values, vec![i64::MAX, 1]);
    }

    #[tokio::test]
    async fn cancelled_compaction_stops_before_the_next_batch() {
        let store = InMemoryStore::new();
        insert_rows(&store, &[("c", 1); 3]).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let compactor = CounterCompactor::new(Arc::new(store.clone()), Duration::from_secs(60));
        assert!(compactor.execute(&cancel).await.unwrap_err().is_cancelled());
        assert_eq!(store.counter_rows("c").await.len(), 3);
    }
}
