use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THREAD_PREFIX: &str = "event-processor-";
pub const DEFAULT_LOG_PREFIX: &str = "event-processor";
pub const DEFAULT_NUM_THREADS: usize = 1;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Construction parameters for [`crate::MultiThreadedEventProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventProcessorConfig {
    /// Worker `i` is named `{thread_prefix}{i}`.
    pub thread_prefix: String,
    /// Context attached to every log line emitted by the processor.
    pub log_prefix: String,
    pub num_threads: usize,
    /// Upper bound on a single blocking poll; workers re-check their stop
    /// signal at least this often.
    pub poll_interval_ms: u64,
    /// Default filter for the binary when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            log_prefix: DEFAULT_LOG_PREFIX.to_string(),
            num_threads: DEFAULT_NUM_THREADS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            log_level: "info".to_string(),
        }
    }
}

impl EventProcessorConfig {
    /// Parses and validates a JSON document; absent fields take defaults.
    pub fn from_json_str(payload: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(payload).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let payload = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&payload)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Errors surfaced while loading processor configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was being read.
        path: PathBuf,
        source: std::io::Error,
    },
    /// The payload is not valid JSON for [`EventProcessorConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_json::Error),
    /// A processor needs at least one worker thread.
    #[error("num_threads must be at least 1")]
    ZeroThreads,
    /// Workers must block for at least one millisecond per poll.
    #[error("poll_interval_ms must be at least 1")]
    ZeroPollInterval,
}
