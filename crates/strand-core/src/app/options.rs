//! Options recognized by the storage.
//!
//! Durations are (de)serialized as integer milliseconds so a config file reads
//! `"queue_poll_interval": 1000` rather than a `{secs, nanos}` pair.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::builder::BuildError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// How long a lock row stays valid before another caller may take it over.
    #[serde(with = "millis")]
    pub lock_lease_duration: Duration,

    /// Upper bound on how long an idle dequeue waits before polling again.
    #[serde(with = "millis")]
    pub queue_poll_interval: Duration,

    /// How long a claimed queue entry stays hidden without a keep-alive.
    #[serde(with = "millis")]
    pub invisibility_timeout: Duration,

    #[serde(with = "millis")]
    pub counter_compaction_interval: Duration,

    #[serde(with = "millis")]
    pub expiration_sweep_interval: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            lock_lease_duration: Duration::from_secs(10 * 60),
            queue_poll_interval: Duration::from_secs(1),
            invisibility_timeout: Duration::from_secs(5 * 60),
            counter_compaction_interval: Duration::from_secs(5 * 60),
            expiration_sweep_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl StorageOptions {
    pub fn from_json_str(json: &str) -> Result<Self, BuildError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Every duration must be strictly positive.
    pub fn validate(&self) -> Result<(), BuildError> {
        let checks = [
            ("lock_lease_duration", self.lock_lease_duration),
            ("queue_poll_interval", self.queue_poll_interval),
            ("invisibility_timeout", self.invisibility_timeout),
            ("counter_compaction_interval", self.counter_compaction_interval),
            ("expiration_sweep_interval", self.expiration_sweep_interval),
        ];
        let zero: Vec<String> = checks
            .iter()
            .filter(|(_, value)| value.is_zero())
            .map(|(name, _)| name.to_string())
            .collect();
        if !zero.is_empty() {
            return Err(BuildError::NonPositiveOptions(zero));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = StorageOptions::default();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn zero_durations_are_reported_by_name() {
        let options = StorageOptions {
            queue_poll_interval: Duration::ZERO,
            expiration_sweep_interval: Duration::ZERO,
            ..StorageOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(
            err,
            BuildError::NonPositiveOptions(names)
                if names == vec!["queue_poll_interval".to_string(), "expiration_sweep_interval".to_string()]
        ));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let options =
            StorageOptions::from_json_str(r#"{ "queue_poll_interval": 250 }"#).unwrap();
        assert_eq!(options.queue_poll_interval, Duration::from_millis(250));
        assert_eq!(
            options.invisibility_timeout,
            StorageOptions::default().invisibility_timeout
        );
    }

    #[test]
    fn json_with_zero_is_rejected() {
        let err = StorageOptions::from_json_str(r#"{ "lock_lease_duration": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("lock_lease_duration"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = StorageOptions::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, BuildError::Parse(_)));
    }
}
