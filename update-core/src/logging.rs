use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_NAME: &str = "update-agent.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
  File,
  FileAndStderr,
}

/// Daily-rolling file log under `log_dir`, optionally mirrored to stderr.
/// Files older than the retention window are removed first.
pub fn init(log_dir: &Path, cfg: &LoggingConfig, output: Output) -> anyhow::Result<()> {
  fs::create_dir_all(log_dir)?;
  let removed = cleanup_old_logs(log_dir, cfg.retention_days);

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
  let _ = FILE_GUARD.set(guard);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(file_writer)
    .with_target(true);

  let registry = tracing_subscriber::registry().with(filter(&cfg.level)).with(file_layer);
  match output {
    Output::File => registry.init(),
    Output::FileAndStderr => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_ansi(false)
          .with_writer(std::io::stderr)
          .with_target(true),
      )
      .init(),
  }

  if removed > 0 {
    tracing::debug!(removed, "expired log files removed");
  }
  Ok(())
}

/// Stderr only, for short-lived tools that keep no log directory.
pub fn init_stderr(level: &str) {
  let _ = tracing_subscriber::registry()
    .with(filter(level))
    .with(
      tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_target(false),
    )
    .try_init();
}

fn filter(level: &str) -> EnvFilter {
  EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> usize {
  if retention_days == 0 {
    return 0;
  }

  let cutoff = SystemTime::now()
    .checked_sub(Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)))
    .unwrap_or(SystemTime::UNIX_EPOCH);

  let Ok(entries) = fs::read_dir(log_dir) else {
    return 0;
  };

  let mut removed = 0;
  for entry in entries.flatten() {
    let path = entry.path();
    if !is_update_log_file(&path) {
      continue;
    }
    let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
      continue;
    };
    if modified < cutoff && fs::remove_file(&path).is_ok() {
      removed += 1;
    }
  }
  removed
}

fn is_update_log_file(path: &Path) -> bool {
  let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
    return false;
  };
  name == LOG_FILE_NAME || name.strip_prefix(LOG_FILE_NAME).is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_rolled_agent_logs_are_cleanup_candidates() {
    assert!(is_update_log_file(Path::new("/logs/update-agent.log")));
    assert!(is_update_log_file(Path::new("/logs/update-agent.log.2024-03-01")));
    assert!(!is_update_log_file(Path::new("/logs/update-agent.logx")));
    assert!(!is_update_log_file(Path::new("/logs/other.log")));
  }

  #[test]
  fn fresh_files_survive_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("update-agent.log.2024-03-01");
    fs::write(&log, b"recent").unwrap();
    assert_eq!(cleanup_old_logs(dir.path(), 0), 0);
    assert_eq!(cleanup_old_logs(dir.path(), 7), 0);
    assert!(log.exists());
  }
}
