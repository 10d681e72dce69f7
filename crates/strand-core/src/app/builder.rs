//! StorageBuilder - ストアと設定から JobStorage を組み立てる
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 不正な設定は build() で拒否し、実行中には持ち込まない

use std::sync::Arc;

use super::options::StorageOptions;
use super::storage::JobStorage;
use crate::ports::{Clock, Store, SystemClock};

/// Invalid configuration, reported before anything runs.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("options must be strictly positive: {0:?}")]
    NonPositiveOptions(Vec<String>),

    #[error("malformed options document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Builds a [`JobStorage`].
///
/// # 使用例
/// ```ignore
/// let storage = StorageBuilder::new(Arc::new(InMemoryStore::new()))
///     .options(StorageOptions::default())
///     .build()?;
/// ```
pub struct StorageBuilder {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    options: StorageOptions,
}

impl StorageBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            options: StorageOptions::default(),
        }
    }

    pub fn options(mut self, options: StorageOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the wall clock used for record timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the options and wire the facade.
    pub fn build(self) -> Result<JobStorage, BuildError> {
        self.options.validate()?;
        Ok(JobStorage::new(self.store, self.clock, self.options))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::impls::InMemoryStore;

    #[test]
    fn build_with_defaults() {
        let storage = StorageBuilder::new(Arc::new(InMemoryStore::new())).build();
        assert!(storage.is_ok());
    }

    #[test]
    fn build_rejects_zero_durations() {
        let options = StorageOptions {
            invisibility_timeout: Duration::ZERO,
            ..StorageOptions::default()
        };
        let result = StorageBuilder::new(Arc::new(InMemoryStore::new()))
            .options(options)
            .build();
        assert!(matches!(
            result,
            Err(BuildError::NonPositiveOptions(names)) if names == vec!["invisibility_timeout".to_string()]
        ));
    }

    #[test]
    fn error_message_names_the_options() {
        let err = BuildError::NonPositiveOptions(vec!["queue_poll_interval".into()]);
        assert!(err.to_string().contains("queue_poll_interval"));
    }
}
