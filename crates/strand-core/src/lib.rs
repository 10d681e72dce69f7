//! strand-core
//!
//! Coordination primitives for a background-job system that keeps all of its
//! state in one transactional store: leased locks, a queue with invisibility
//! leases, batched write transactions, and the maintenance processes that keep
//! counters and expired rows in check.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, records, command, errors）
//! - **ports**: 抽象化レイヤー（Store / StoreTransaction, Clock）
//! - **app**: アプリケーションロジック（builder, lock, queue, lease, transaction, 定期処理）
//! - **impls**: 実装（InMemoryStore など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{BuildError, FetchedJobLease, JobStorage, LockHandle, StorageBuilder, StorageOptions, WriteTransaction};
pub use domain::{Command, JobId, StorageError};
