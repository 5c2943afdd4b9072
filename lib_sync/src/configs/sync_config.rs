use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid push URL {0:?}: {1}")]
    InvalidUrl(String, String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// # Sync Config
///
/// Every field has a default, so a JSON file only needs to carry the values it
/// overrides. Keys are camelCase to match the other JSON the platform ships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Push endpoint (`ws://` or `wss://`).
    pub url: String,
    /// First reconnect delay ceiling; doubles per failed attempt.
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for the reconnect delay ceiling.
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed attempts before the connection reports degraded mode.
    pub degraded_after_attempts: u32,
    /// Seconds without any inbound message before the connection is treated as dead.
    pub silent_failure_timeout_seconds: u64,
    /// Default timeout for tracked operations.
    pub operation_timeout_ms: u64,
    /// Minimum spacing between applied upload-progress patches per operation.
    pub progress_min_interval_ms: u64,
    /// How long a closed scope keeps its cached data before eviction. The
    /// connection closes once the last lingering scope is evicted.
    pub scope_linger_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9010/push".to_string(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            degraded_after_attempts: 5,
            silent_failure_timeout_seconds: 60,
            operation_timeout_ms: 30_000,
            progress_min_interval_ms: 100,
            scope_linger_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Reads a JSON file; missing keys fall back to defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidUrl(self.url.clone(), e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(
                self.url.clone(),
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnectBaseDelayMs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnectMaxDelayMs",
                reason: format!(
                    "{} is below reconnectBaseDelayMs ({})",
                    self.reconnect_max_delay_ms, self.reconnect_base_delay_ms
                ),
            });
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "operationTimeoutMs",
                reason: "every tracked operation needs a bounded timeout".to_string(),
            });
        }
        if self.silent_failure_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "silentFailureTimeoutSeconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn silent_failure_timeout(&self) -> Duration {
        Duration::from_secs(self.silent_failure_timeout_seconds)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }

    pub fn scope_linger(&self) -> Duration {
        Duration::from_millis(self.scope_linger_ms)
    }
}

impl fmt::Display for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncConfig
    Url: {},
    Reconnect delay: {}ms..{}ms,
    Degraded after: {} attempts,
    Silent failure timeout: {}s,
    Operation timeout: {}ms,
    Progress interval: {}ms,
    Scope linger: {}ms
",
            self.url,
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.degraded_after_attempts,
            self.silent_failure_timeout_seconds,
            self.operation_timeout_ms,
            self.progress_min_interval_ms,
            self.scope_linger_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "url": "wss://push.example.com/sync", "reconnectMaxDelayMs": 10000 }}"#).unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.url, "wss://push.example.com/sync");
        assert_eq!(config.reconnect_max_delay_ms, 10_000);
        assert_eq!(config.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.operation_timeout_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_http_scheme() {
        let config = SyncConfig {
            url: "https://push.example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_, _))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff_bounds() {
        let config = SyncConfig {
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "reconnectMaxDelayMs", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_silent_failure_timeout() {
        let config = SyncConfig {
            silent_failure_timeout_seconds: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "silentFailureTimeoutSeconds", .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = SyncConfig::from_json_file(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
