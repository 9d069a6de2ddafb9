//! Tracing setup for the daemon and its CLI.
//!
//! `serve` logs at info by default since it is the only record of query
//! routing, peer calls and transfer state changes. One-shot commands stay at
//! warn so their stdout is readable. Each `-v` raises the level by one step
//! and `RUST_LOG` overrides both.
//!
//! An optional log file receives JSON lines, rotated daily, at debug level
//! regardless of the stderr level.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Cannot create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Log file path {0} has no file name")]
    NoFileName(PathBuf),

    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Stderr level for `verbose` repetitions of `-v`
pub fn level_for(verbose: u8, serving: bool) -> LevelFilter {
    let base = if serving { 2 } else { 1 };
    let step = (base + verbose as usize).min(LEVELS.len() - 1);
    LEVELS[step]
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for stderr output
    pub level: LevelFilter,
    /// Base path of the rotated JSON log; the date is appended
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: level_for(0, false),
            log_file: None,
        }
    }
}

/// Keeps the background log writer alive; flushes on drop.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(config: &LogConfig) -> Result<LogGuard, LogError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.max(file_level(config)).into())
        .from_env_lossy();

    let (file_layer, file_guard) = match config.log_file {
        Some(ref path) => {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let prefix = path
                .file_name()
                .ok_or_else(|| LogError::NoFileName(path.clone()))?;
            std::fs::create_dir_all(&dir).map_err(|source| LogError::CreateDir {
                path: dir.clone(),
                source,
            })?;

            let appender = tracing_appender::rolling::daily(&dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(config.level);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

fn file_level(config: &LogConfig) -> LevelFilter {
    if config.log_file.is_some() {
        LevelFilter::DEBUG
    } else {
        LevelFilter::OFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_commands() {
        assert_eq!(level_for(0, false), LevelFilter::WARN);
        assert_eq!(level_for(1, false), LevelFilter::INFO);
        assert_eq!(level_for(2, false), LevelFilter::DEBUG);
    }

    #[test]
    fn test_level_for_serve() {
        assert_eq!(level_for(0, true), LevelFilter::INFO);
        assert_eq!(level_for(1, true), LevelFilter::DEBUG);
        assert_eq!(level_for(2, true), LevelFilter::TRACE);
        assert_eq!(level_for(200, true), LevelFilter::TRACE);
    }

    #[test]
    fn test_file_level() {
        let mut config = LogConfig::default();
        assert_eq!(file_level(&config), LevelFilter::OFF);
        config.log_file = Some(PathBuf::from("/tmp/smewtd.log"));
        assert_eq!(file_level(&config), LevelFilter::DEBUG);
    }

    #[test]
    fn test_log_file_without_name() {
        let config = LogConfig {
            level: LevelFilter::WARN,
            log_file: Some(PathBuf::from("/")),
        };
        assert!(matches!(init_logging(&config), Err(LogError::NoFileName(_))));
    }
}
