use crate::FetchError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Retry, size and timeout policy for archive fetches.
///
/// Every field has a default, so a config file may set only what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_archive_bytes: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: format!("pallet/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before attempt `attempt + 1`, doubling from the initial delay.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }

    pub fn validate(&self) -> Result<(), FetchError> {
        if self.max_attempts == 0 {
            return Err(FetchError::Config("max_attempts must be at least 1".to_owned()));
        }
        if self.max_archive_bytes == 0 {
            return Err(FetchError::Config(
                "max_archive_bytes must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = FetchConfig::default();
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.backoff_for(1), Duration::from_millis(500));
        assert_eq!(c.max_archive_bytes, 256 * 1024 * 1024);
        assert!(c.user_agent.starts_with("pallet/"));
    }

    #[test]
    fn backoff_doubles() {
        let c = FetchConfig::default();
        assert_eq!(c.backoff_for(1), Duration::from_millis(500));
        assert_eq!(c.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(c.backoff_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn config_roundtrip() {
        let config = FetchConfig {
            max_attempts: 5,
            ..FetchConfig::default()
        };
        let text = serde_json::to_string_pretty(&config).unwrap();
        assert_eq!(serde_json::from_str::<FetchConfig>(&text).unwrap(), config);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let c: FetchConfig = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(c.max_attempts, 7);
        assert_eq!(c.initial_backoff_ms, DEFAULT_INITIAL_BACKOFF_MS);
    }

    #[test]
    fn zero_attempts_rejected() {
        let c: FetchConfig = serde_json::from_str(r#"{"max_attempts": 0}"#).unwrap();
        assert!(matches!(c.validate(), Err(FetchError::Config(_))));
    }
}
