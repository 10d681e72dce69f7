//! App - アプリケーション層
//!
//! ports（Store, Clock）を組み合わせて調整プリミティブを実装します。
//!
//! # 主要コンポーネント
//! - **StorageBuilder / JobStorage**: 構築と外部公開用ファサード
//! - **DistributedLockProvider**: リース付きの名前付きロック
//! - **PersistentJobQueue / FetchedJobLease**: 可視性リース付きのキュー
//! - **WriteTransaction**: コマンドのバッチをアトミックにコミット
//! - **CounterCompactor / ExpirationSweeper**: 定期メンテナンス（ProcessGroup で実行）

pub mod builder;
pub mod counter_compactor;
pub mod expiration_sweeper;
pub mod lease;
pub mod lock;
pub mod options;
pub mod process;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod transaction;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, StorageBuilder};
pub use self::counter_compactor::{COMPACTION_BATCH_SIZE, CompactionReport, CounterCompactor};
pub use self::expiration_sweeper::{ExpirationSweeper, SweepReport};
pub use self::lease::FetchedJobLease;
pub use self::lock::{DistributedLockProvider, LockHandle};
pub use self::options::StorageOptions;
pub use self::process::{BackgroundProcess, ProcessGroup};
pub use self::queue::{PersistentJobQueue, QueueSignal};
pub use self::retry::RetryPolicy;
pub use self::storage::JobStorage;
pub use self::transaction::WriteTransaction;
