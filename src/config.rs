// ⚙️ Cleansing Configuration - Knobs for the reconciliation engine
//
// Loaded from JSON (all fields optional), or built in code with the with_*
// helpers. Durations are whole seconds on disk.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// One day between unforced runs
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleansingConfig {
    /// Minimum time between two unforced reconciliations
    #[serde(rename = "min_interval_secs", with = "duration_secs")]
    pub min_interval: Duration,

    /// Upper bound on concurrently running history compactions
    pub max_concurrency: usize,

    /// How many times a conflicting group is retried before it is skipped
    pub conflict_retries: u32,

    /// How long a store connection waits on a locked database
    #[serde(rename = "busy_timeout_secs", with = "duration_secs")]
    pub busy_timeout: Duration,
}

impl Default for CleansingConfig {
    fn default() -> Self {
        CleansingConfig {
            min_interval: DEFAULT_MIN_INTERVAL,
            max_concurrency: 4,
            conflict_retries: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl CleansingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: CleansingConfig = serde_json::from_str(&content)
            .context("Failed to parse config JSON")?;

        Ok(config.normalized())
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self.normalized()
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    // A zero-permit semaphore would never make progress
    fn normalized(mut self) -> Self {
        self.max_concurrency = self.max_concurrency.max(1);
        self
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CleansingConfig::default();
        assert_eq!(config.min_interval, Duration::from_secs(86_400));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.conflict_retries, 1);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"min_interval_secs": 3600, "max_concurrency": 0}}"#).unwrap();

        let config = CleansingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.min_interval, Duration::from_secs(3600));
        assert_eq!(config.max_concurrency, 1, "zero concurrency is clamped");
        assert_eq!(config.conflict_retries, 1);
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = CleansingConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_builder() {
        let config = CleansingConfig::new()
            .with_min_interval(Duration::from_secs(60))
            .with_max_concurrency(8)
            .with_conflict_retries(3);

        assert_eq!(config.min_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.conflict_retries, 3);
    }
}
