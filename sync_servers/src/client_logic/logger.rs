use anyhow::Result;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log files kept per directory, the current one included.
const KEEP_LOG_FILES: usize = 5;

/// # Setup Logging
///
/// Console output plus a JSON file in `log_dir` named after `basename`.
/// `RUST_LOG` wins over `log_level` when set. Keep the returned guard alive
/// for the lifetime of the process or buffered file lines are lost.
pub fn setup_logging(log_dir: &Path, log_level: &str, basename: &str) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(log_dir, basename, KEEP_LOG_FILES - 1)?;

    let log_file_name = format!("{}_{}.log", basename, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let (file_writer, guard) = non_blocking(rolling::never(log_dir, log_file_name));

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer).json();

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging initialized with level: {}", log_level);
    Ok(guard)
}

/// Deletes this binary's older `.log` files, keeping the `keep` newest.
pub fn cleanup_old_logs(log_dir: &Path, basename: &str, keep: usize) -> Result<usize> {
    let prefix = format!("{}_", basename);
    let mut entries: Vec<(SystemTime, std::path::PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cleanup_keeps_newest_and_ignores_others() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            fs::write(dir.path().join(format!("sync_client_{}.log", i)), "x").unwrap();
            // Distinct mtimes
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("push_dummy_0.log"), "x").unwrap();
        fs::write(dir.path().join("sync_client.conf"), "{}").unwrap();

        let removed = cleanup_old_logs(dir.path(), "sync_client", 2).unwrap();
        assert_eq!(removed, 2);
        assert!(dir.path().join("sync_client_3.log").exists());
        assert!(dir.path().join("sync_client_2.log").exists());
        assert!(!dir.path().join("sync_client_0.log").exists());
        assert!(dir.path().join("push_dummy_0.log").exists());
        assert!(dir.path().join("sync_client.conf").exists());
    }
}
