use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::retry::RetryPolicy;
use crate::domain::StorageError;

/// A periodic maintenance routine.
///
/// `execute` performs one pass, then sleeps for the routine's interval before
/// returning. It is meant to be called again and again by a scheduling loop
/// such as [`ProcessGroup`].
#[async_trait]
pub trait BackgroundProcess: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with `Cancelled` once `cancel` fires, mid-pass or mid-sleep.
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), StorageError>;
}

/// Sleep for `interval` unless cancelled first.
pub(crate) async fn pause(cancel: &CancellationToken, interval: Duration) -> Result<(), StorageError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// Background process group handle.
/// - each process runs on its own task until shutdown
/// - failures other than cancellation are logged and retried with backoff
pub struct ProcessGroup {
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl ProcessGroup {
    pub fn spawn(
        processes: Vec<Arc<dyn BackgroundProcess>>,
        shutdown: CancellationToken,
        retry: RetryPolicy,
    ) -> Self {
        let mut joins = Vec::with_capacity(processes.len());
        for process in processes {
            let shutdown = shutdown.clone();
            let retry = retry.clone();
            joins.push(tokio::spawn(async move {
                process_loop(process, shutdown, retry).await;
            }));
        }
        Self { shutdown, joins }
    }

    /// Ask every process to stop. In-flight store calls finish first.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn process_loop(
    process: Arc<dyn BackgroundProcess>,
    shutdown: CancellationToken,
    retry: RetryPolicy,
) {
    let name = process.name();
    info!(process = name, "background process started");

    let mut failures: u32 = 0;
    while !shutdown.is_cancelled() {
        match process.execute(&shutdown).await {
            Ok(()) => failures = 0,
            Err(err) if err.is_cancelled() => break,
            Err(err) => {
                failures = failures.saturating_add(1);
                let delay = retry.next_delay(failures);
                error!(
                    process = name,
                    error = %err,
                    failures,
                    retry_in = ?delay,
                    "background process failed"
                );
                if pause(&shutdown, delay).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(process = name, "background process stopped");
}
