//! Logging setup with a reloadable filter and optional daily log files.

use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "rendershard=info,shard_protocol=info";

pub const VERBOSE_LOG_FILTER: &str = "rendershard=debug,shard_protocol=debug";

const LOG_FILE_PREFIX: &str = "rendershard.log";

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Filter directive. `RUST_LOG` wins when set.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Emit JSON lines on the console instead of human readable text.
    pub json: bool,
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            json: false,
            ansi: true,
        }
    }
}

/// Handle to the installed subscriber.
pub struct LoggingHandle {
    handle: FilterHandle,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive, e.g. `rendershard=debug`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

/// Install the global subscriber.
///
/// Keep the returned handle alive for the lifetime of the process, it owns
/// the file writer guard.
pub fn init_logging(options: &LoggingOptions) -> Result<LoggingHandle> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let console = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_timer(LocalTimer)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(options.ansi)
            .with_timer(LocalTimer)
            .boxed()
    };

    let (file, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(LoggingHandle {
        handle: filter_handle,
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("rendershard=info"));
        assert!(DEFAULT_LOG_FILTER.contains("shard_protocol=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_filter_reload() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new(DEFAULT_LOG_FILTER));
        let _subscriber = tracing_subscriber::registry().with(layer);
        let logging = LoggingHandle {
            handle,
            _guard: None,
        };

        assert!(logging.get_filter().contains("rendershard=info"));
        logging.set_filter(VERBOSE_LOG_FILTER).unwrap();
        assert!(logging.get_filter().contains("rendershard=debug"));
        assert!(logging.set_filter("rendershard=loud").is_err());
        assert!(logging.get_filter().contains("rendershard=debug"));
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: LoggingOptions = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(options.json);
        assert_eq!(options.filter, DEFAULT_LOG_FILTER);
        assert!(options.log_dir.is_none());
    }
}
