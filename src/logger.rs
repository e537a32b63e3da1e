use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Where `run` writes its logs, relative to the root directory.
pub const LOG_FILE: &str = "logs/comfy-pilot.log";
/// Newline-delimited JSON reports of finished executions.
pub const EVENT_FILE: &str = "logs/comfy-pilot.json";

/// Installs the global subscriber.
///
/// - stdout and a daily-rolling text file get everything allowed by `log_level`
///   (an `EnvFilter` directive such as `"info"` or `"pilot_bridge=debug"`).
/// - events with target `request` also land as JSON lines in `event_file`.
///
/// With `files == false` only stdout is used.
pub fn init_tracing(root: &Path, log_level: &str, files: bool) -> Result<()> {
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(log_level));

    if !files {
        return Registry::default()
            .with(stdout_layer)
            .try_init()
            .context("a tracing subscriber is already installed");
    }

    let (log_dir, log_name) = split_path(root.join(LOG_FILE))?;
    let (event_dir, event_name) = split_path(root.join(EVENT_FILE))?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let txt_layer = fmt::layer()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_layer = fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a tracing subscriber is already installed")
}

fn split_path(path: PathBuf) -> Result<(PathBuf, PathBuf)> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?
        .to_path_buf();
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?
        .into();
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths_split_into_dir_and_name() {
        let (dir, name) = split_path(PathBuf::from("/tmp/root").join(LOG_FILE)).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/root/logs"));
        assert_eq!(name, PathBuf::from("comfy-pilot.log"));
        assert!(split_path(PathBuf::from("/")).is_err());
    }
}
