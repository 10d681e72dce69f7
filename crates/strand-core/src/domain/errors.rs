//! Errors - 呼び出し元へ伝播するエラー
//!
//! 楽観的並行制御の競合（unique 制約違反・トークン不一致）はここには含めません。
//! 競合は `ports::WriteOutcome::Conflict` として返り、各呼び出し箇所で
//! リトライか no-op として処理されます。

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("timed out after {timeout:?} waiting for lock on resource `{resource}`")]
    LockTimeout { resource: String, timeout: Duration },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl StorageError {
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

/// Reject empty (or whitespace-only) names before touching the store.
pub(crate) fn require_name(name: &'static str, value: &str) -> Result<(), StorageError> {
    if value.trim().is_empty() {
        return Err(StorageError::invalid_argument(name, "must not be empty"));
    }
    Ok(())
}

/// Reject zero durations before touching the store.
pub(crate) fn require_positive(name: &'static str, value: Duration) -> Result<(), StorageError> {
    if value.is_zero() {
        return Err(StorageError::invalid_argument(name, "must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_names_are_rejected() {
        assert!(require_name("resource", "lock:a").is_ok());
        let err = require_name("resource", "  ").unwrap_err();
        assert!(err.to_string().contains("resource"));
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert!(require_positive("timeout", Duration::from_millis(1)).is_ok());
        assert!(matches!(
            require_positive("timeout", Duration::ZERO),
            Err(StorageError::InvalidArgument { name: "timeout", .. })
        ));
    }
}
