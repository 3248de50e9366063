//! Tracing setup shared by the CLI and the webhook server.
//!
//! Console output is human-readable by default or JSON when configured. When a
//! log directory is set, a second JSON layer writes daily-rotated files through
//! a non-blocking appender; the returned guard must outlive the process's work.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "cowork.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `cowork=debug,reqwest=warn`
    pub level: String,
    pub json: bool,
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

impl LogSettings {
    /// `RUST_LOG` wins over the configured level when set.
    pub fn filter(&self) -> EnvFilter {
        let directive = std::env::var(EnvFilter::DEFAULT_ENV)
            .ok()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| self.level.clone());
        parse_filter(&directive)
    }
}

fn parse_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when file output is enabled. A subscriber
/// that is already installed is left in place.
pub fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let console = if settings.json {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
            .with_filter(settings.filter())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(settings.filter())
            .boxed()
    };

    let (file_layer, guard) = match &settings.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(settings.filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already set, keeping it");
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_filter_keeps_target_directives() {
        assert!(parse_filter("cowork=debug").to_string().contains("cowork=debug"));
    }

    #[test]
    fn test_init_creates_log_dir_and_tolerates_reinit() {
        let dir = tempdir().unwrap();
        let settings = LogSettings {
            level: "debug".into(),
            json: true,
            dir: Some(dir.path().join("logs")),
        };
        let guard = init_logging(&settings).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());

        let again = init_logging(&LogSettings::default()).unwrap();
        assert!(again.is_none());
    }
}
