//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStore**: 直列化トランザクションを持つ参照ストア
//! - **FaultyStore**: 障害注入ラッパー（テスト専用）
//!
//! # 本番用実装
//! リレーショナル DB 向けの `Store` 実装は別クレートに配置します。

#[cfg(test)]
pub(crate) mod faulty_store;
pub mod inmem_store;

#[cfg(test)]
pub(crate) use self::faulty_store::FaultyStore;
pub use self::inmem_store::InMemoryStore;
