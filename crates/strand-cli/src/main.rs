use std::sync::Arc;
use std::time::Duration;

use strand_core::app::{StorageBuilder, StorageOptions};
use strand_core::domain::StateChange;
use strand_core::impls::InMemoryStore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// RUST_LOG で上書き可能（デフォルト info）
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `STRAND_CONFIG` が指す JSON ファイルがあれば読む。なければデフォルト。
fn load_options() -> CliResult<StorageOptions> {
    match std::env::var("STRAND_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)?;
            let options = StorageOptions::from_json_str(&json)?;
            info!(path = %path, "loaded options");
            Ok(options)
        }
        Err(_) => Ok(StorageOptions::default()),
    }
}

#[tokio::main]
async fn main() -> CliResult<()> {
    init_tracing();

    // (A) ストアとファサードを用意
    let store = InMemoryStore::new();
    let storage = StorageBuilder::new(Arc::new(store.clone()))
        .options(load_options()?)
        .build()?;
    let processes = storage.spawn_processes()?;

    // (B) ジョブ作成 + 状態遷移 + enqueue を 1 コミットで
    let job = storage
        .create_job(
            serde_json::json!({ "type": "Greeter", "method": "hello", "args": ["strand"] }),
            None,
        )
        .await?;
    let mut tx = storage.create_write_transaction()?;
    tx.set_job_state(job, StateChange::new("Enqueued").with_reason("demo"))?
        .add_to_queue("default", job)?
        .increment_counter("stats:enqueued")?;
    tx.commit().await?;
    info!(job_id = %job, "job enqueued");

    // (C) dequeue → 処理 → complete
    let cancel = CancellationToken::new();
    let lease = storage.dequeue(&["default"], &cancel).await?;
    info!(job_id = %lease.job_id(), queue = lease.queue(), "job fetched");

    let lock = storage
        .acquire_lock(&format!("job:{}:state", lease.job_id()), Duration::from_secs(5))
        .await?;
    let mut tx = storage.create_write_transaction()?;
    tx.set_job_state(lease.job_id(), StateChange::new("Succeeded"))?
        .increment_counter("stats:succeeded")?
        .insert_to_list("succeeded", &lease.job_id().to_string())?;
    tx.commit().await?;
    lock.release().await?;
    lease.complete().await?;

    // (D) 結果を表示
    let record = storage.job(job).await?;
    info!(
        state = ?record.and_then(|job| job.state_name),
        remaining = store.queue_entries().await.len(),
        succeeded = store.counter_value("stats:succeeded").await,
        "done"
    );

    // (E) 後片付け
    storage.dispose();
    processes.shutdown_and_join().await;
    Ok(())
}
