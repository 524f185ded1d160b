//! Subscriber setup with a reloadable filter.
//!
//! `LAMPLIGHTER_DEBUG_LOG` wins, then `RUST_LOG`, then the configured
//! `log_level`. Only the last one follows configuration reloads.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    env_override: bool,
    _guard: WorkerGuard,
}

impl LogControl {
    /// Applies a reloaded `log_level` unless the environment pinned one.
    pub fn apply_level(&self, level: &str) {
        if self.env_override {
            return;
        }
        if let Err(err) = self.handle.reload(EnvFilter::new(filter_directive(level))) {
            tracing::warn!(error = %err, "Failed to update log filter");
        }
    }
}

pub fn init(level: &str, log_file: Option<&Path>) -> LogControl {
    let (filter, env_override) = initial_filter(level);
    let (filter_layer, handle) = reload::Layer::new(filter);

    let appender = log_file.and_then(|path| match file_appender(path) {
        Ok(appender) => Some(appender),
        Err(err) => {
            eprintln!("lamplighter: logging to stderr, cannot open {}: {}", path.display(), err);
            None
        }
    });
    let to_file = appender.is_some();
    let (writer, guard) = match appender {
        Some(appender) => tracing_appender::non_blocking(appender),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(!to_file),
        )
        .init();

    LogControl {
        handle,
        env_override,
        _guard: guard,
    }
}

fn initial_filter(level: &str) -> (EnvFilter, bool) {
    let debug_enabled = env::var("LAMPLIGHTER_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        return (EnvFilter::new("debug"), true);
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(filter_directive(level)), false),
    }
}

/// Maps the legacy verbosity names onto tracing levels. Anything else is
/// passed through as a filter directive.
pub fn filter_directive(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "none" => "off".to_string(),
        "brief" => "info".to_string(),
        "info" => "debug".to_string(),
        "debug" => "trace".to_string(),
        "" => "info".to_string(),
        other => other.to_string(),
    }
}

fn file_appender(path: &Path) -> Result<RollingFileAppender, String> {
    let (dir, name) =
        split_log_path(path).ok_or_else(|| "log_file has no file name".to_string())?;
    fs_err::create_dir_all(dir).map_err(|err| format!("Failed to create log directory: {}", err))?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy().to_string())
        .build(dir)
        .map_err(|err| format!("Failed to open log file: {}", err))
}

fn split_log_path(path: &Path) -> Option<(&Path, &std::ffi::OsStr)> {
    let name = path.file_name()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Some((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_levels_map_one_step_more_verbose() {
        assert_eq!(filter_directive("none"), "off");
        assert_eq!(filter_directive("BRIEF"), "info");
        assert_eq!(filter_directive("info"), "debug");
        assert_eq!(filter_directive("debug"), "trace");
        assert_eq!(filter_directive("warn"), "warn");
        assert_eq!(filter_directive("lamplighter_core=debug"), "lamplighter_core=debug");
    }

    #[test]
    fn log_paths_split_into_directory_and_file() {
        let (dir, name) = split_log_path(Path::new("/var/log/lamplighter.log")).expect("split");
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(name, "lamplighter.log");

        let (dir, _) = split_log_path(Path::new("lamplighter.log")).expect("split");
        assert_eq!(dir, Path::new("."));
    }
}
