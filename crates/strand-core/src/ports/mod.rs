//! Ports - 抽象化レイヤー
//!
//! 外部システム（リレーショナルストア、時計）へのインターフェースを定義します。
//!
//! # 設計原則
//! - ストアが唯一の正本（source of truth）
//! - プロセス内のロックは最適化にすぎず、正しさはストアの競合検出が保証する

pub mod clock;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::store::{Store, StoreTransaction, WriteOutcome};
