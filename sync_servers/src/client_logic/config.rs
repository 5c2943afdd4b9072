use clap::Parser;
use lib_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Course sync client: keeps a normalized cache of courses in sync with a push server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SYNC_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SYNC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SYNC_URL", help = "Push server WebSocket URL.")]
    pub url: Option<String>,

    #[clap(long = "course", env = "SYNC_COURSES", value_delimiter = ',', help = "Course ids to open (repeatable or comma-separated).")]
    #[serde(default)]
    pub courses: Vec<String>,

    #[clap(long, env = "SYNC_SNAPSHOT_DIR", help = "Directory with <courseId>.json snapshots used to answer refetch requests.")]
    pub snapshot_dir: Option<PathBuf>,

    #[clap(long, env = "SYNC_DUMP_INTERVAL_SECONDS", help = "Seconds between cache summaries in the log.")]
    pub dump_interval_seconds: Option<u64>,

    #[clap(long, env = "SYNC_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "SYNC_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "SYNC_DEGRADED_AFTER_ATTEMPTS", help = "Failed attempts before the connection reports degraded mode.")]
    pub degraded_after_attempts: Option<u32>,

    #[clap(long, env = "SYNC_SILENT_FAILURE_TIMEOUT_SECONDS", help = "Seconds without inbound traffic before reconnecting.")]
    pub silent_failure_timeout_seconds: Option<u64>,

    #[clap(long, env = "SYNC_OPERATION_TIMEOUT_MS", help = "Timeout in milliseconds for tracked operations.")]
    pub operation_timeout_ms: Option<u64>,

    #[clap(long, env = "SYNC_PROGRESS_MIN_INTERVAL_MS", help = "Minimum spacing in milliseconds between upload progress patches.")]
    pub progress_min_interval_ms: Option<u64>,

    #[clap(long, env = "SYNC_SCOPE_LINGER_MS", help = "Milliseconds a closed course stays cached.")]
    pub scope_linger_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            url: other.url.or(self.url),
            courses: if other.courses.is_empty() { self.courses } else { other.courses },
            snapshot_dir: other.snapshot_dir.or(self.snapshot_dir),
            dump_interval_seconds: other.dump_interval_seconds.or(self.dump_interval_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            degraded_after_attempts: other.degraded_after_attempts.or(self.degraded_after_attempts),
            silent_failure_timeout_seconds: other.silent_failure_timeout_seconds.or(self.silent_failure_timeout_seconds),
            operation_timeout_ms: other.operation_timeout_ms.or(self.operation_timeout_ms),
            progress_min_interval_ms: other.progress_min_interval_ms.or(self.progress_min_interval_ms),
            scope_linger_ms: other.scope_linger_ms.or(self.scope_linger_ms),
        }
    }

    /// Engine settings; anything left unset takes the library default.
    pub fn sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            url: self.url.clone().unwrap_or(defaults.url),
            reconnect_base_delay_ms: self.reconnect_base_delay_ms.unwrap_or(defaults.reconnect_base_delay_ms),
            reconnect_max_delay_ms: self.reconnect_max_delay_ms.unwrap_or(defaults.reconnect_max_delay_ms),
            degraded_after_attempts: self.degraded_after_attempts.unwrap_or(defaults.degraded_after_attempts),
            silent_failure_timeout_seconds: self
                .silent_failure_timeout_seconds
                .unwrap_or(defaults.silent_failure_timeout_seconds),
            operation_timeout_ms: self.operation_timeout_ms.unwrap_or(defaults.operation_timeout_ms),
            progress_min_interval_ms: self.progress_min_interval_ms.unwrap_or(defaults.progress_min_interval_ms),
            scope_linger_ms: self.scope_linger_ms.unwrap_or(defaults.scope_linger_ms),
        }
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        dump_interval_seconds: Some(30),
        ..Default::default()
    }
}

/// Defaults ← JSON file ← environment/CLI.
pub fn load_config() -> anyhow::Result<Config> {
    resolve(Config::parse())
}

pub fn resolve(cli_args: Config) -> anyhow::Result<Config> {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("sync_client.conf"));

    let mut current_config = defaults();

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)?;
        match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => current_config = current_config.merge(file_config),
            Err(e) => {
                tracing::warn!("Failed to parse config file {}: {}. Falling back to other sources.", config_file_path.display(), e);
            }
        }
    } else {
        tracing::info!("Config file not found at {}. Using defaults and environment/CLI variables.", config_file_path.display());
    }

    current_config = current_config.merge(cli_args);
    current_config.sync_config().validate()?;
    Ok(current_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "url": "ws://file:9010/push", "courses": ["c1"], "operationTimeoutMs": 5000, "logLevel": "debug" }}"#
        )
        .unwrap();

        let cli = Config::parse_from([
            "sync_client",
            "--config-path",
            file.path().to_str().unwrap(),
            "--url",
            "ws://cli:9010/push",
        ]);
        let config = resolve(cli).unwrap();

        assert_eq!(config.url.as_deref(), Some("ws://cli:9010/push"));
        assert_eq!(config.courses, vec!["c1"]);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.dump_interval_seconds, Some(30));

        let sync = config.sync_config();
        assert_eq!(sync.operation_timeout_ms, 5_000);
        assert_eq!(sync.reconnect_max_delay_ms, 30_000);
    }

    #[test]
    fn test_courses_accept_comma_list() {
        let cli = Config::parse_from(["sync_client", "--course", "c1,c2", "--course", "c3"]);
        assert_eq!(cli.courses, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let cli = Config::parse_from([
            "sync_client",
            "--config-path",
            "/nonexistent/sync_client.conf",
            "--url",
            "http://not-a-socket",
        ]);
        assert!(resolve(cli).is_err());
    }
}
