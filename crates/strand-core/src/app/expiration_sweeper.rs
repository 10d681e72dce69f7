//! ExpirationSweeper - expire_at を過ぎた行を全種別まとめて削除する定期処理

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::{BackgroundProcess, pause};
use crate::domain::{ExpirableKind, StorageError};
use crate::ports::{Clock, Store, WriteOutcome};

/// Rows removed per kind by one sweep. Empty when the commit lost a race.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<(ExpirableKind, usize)>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.removed.iter().map(|(_, rows)| rows).sum()
    }

    pub fn removed(&self, kind: ExpirableKind) -> usize {
        self.removed
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, rows)| *rows)
    }
}

pub struct ExpirationSweeper {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// Delete every expired row of every kind in one commit.
    pub async fn sweep(&self) -> Result<SweepReport, StorageError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut removed = Vec::with_capacity(ExpirableKind::ALL.len());
        for kind in ExpirableKind::ALL {
            removed.push((kind, tx.delete_expired(kind, now).await?));
        }

        match tx.commit().await? {
            WriteOutcome::Applied => Ok(SweepReport { removed }),
            WriteOutcome::Conflict => {
                debug!("expiration sweep conflicted; next pass picks it up");
                Ok(SweepReport::default())
            }
        }
    }
}

#[async_trait]
impl BackgroundProcess for ExpirationSweeper {
    fn name(&self) -> &'static str {
        "expiration-sweeper"
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let report = self.sweep().await?;
        if report.total() > 0 {
            let kinds: Vec<String> = report
                .removed
                .iter()
                .filter(|(_, rows)| *rows > 0)
                .map(|(kind, rows)| format!("{}={rows}", kind.as_str()))
                .collect();
            info!(removed = report.total(), kinds = %kinds.join(","), "expired rows swept");
        }
        pause(cancel, self.interval).await
    }
}
