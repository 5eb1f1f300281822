use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::BackoffPolicy;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where reassembled bytes are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    /// Collect everything into one in-memory buffer.
    #[default]
    Memory,
    /// Stream into a temporary file next to this path, renamed on success.
    File(PathBuf),
}

/// Options for a single transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size_bytes: u64,
    pub concurrency_limit: usize,
    /// Failed attempts allowed per chunk before the session fails.
    pub retry_ceiling: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// A fetch that receives no body bytes for this long is retried.
    pub stall_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// Bandwidth cap shared by all fetches of the session. 0 means unlimited.
    pub max_bytes_per_sec: u64,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    /// Hex SHA-256 the assembled output must match.
    pub expected_sha256: Option<String>,
    pub output: OutputTarget,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 4 * MIB,
            concurrency_limit: 4,
            retry_ceiling: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            stall_timeout_ms: 14_000,
            connect_timeout_ms: 10_000,
            probe_timeout_ms: 30_000,
            max_bytes_per_sec: 0,
            content_type: None,
            user_agent: None,
            expected_sha256: None,
            output: OutputTarget::Memory,
        }
    }
}

impl TransferConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid("chunk_size_bytes must be greater than zero".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be at least 1".into()));
        }
        if self.retry_ceiling == 0 {
            return Err(ConfigError::Invalid("retry_ceiling must be at least 1".into()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if self.stall_timeout_ms == 0 {
            return Err(ConfigError::Invalid("stall_timeout_ms must be greater than zero".into()));
        }
        if let Some(expected) = &self.expected_sha256 {
            let well_formed = expected.len() == 64 && expected.chars().all(|c| c.is_ascii_hexdigit());
            if !well_formed {
                return Err(ConfigError::Invalid(format!("expected_sha256 is not a hex SHA-256: {expected}")));
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
