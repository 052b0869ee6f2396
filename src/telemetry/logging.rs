//! Logging setup for applications embedding the ETL core
//!
//! Console output goes to stderr; file output (when a log directory is set)
//! goes through a daily rolling, non-blocking appender.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::ErrorRecord;

const LOG_FILE_PREFIX: &str = "fedetl.log";

/// Directives appended to every filter to quiet runtime internals
const NOISE_DIRECTIVES: &[&str] = &["tokio=warn", "hyper=warn", "reqwest=warn"];

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Directory for rolling log files; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Filter for file output
    pub file_log_level: String,
    /// Filter for console output
    pub console_log_level: String,
    pub console_enabled: bool,
    /// Emit JSON lines instead of plain text
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_log_level: "info".to_string(),
            console_log_level: "warn".to_string(),
            console_enabled: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from `FED_ETL_LOG_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = vars.get("FED_ETL_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = vars.get("FED_ETL_LOG_FILE_LEVEL") {
            config.file_log_level = level.clone();
        }
        if let Some(level) = vars.get("FED_ETL_LOG_LEVEL") {
            config.console_log_level = level.clone();
        }
        if let Some(enabled) = vars.get("FED_ETL_LOG_CONSOLE") {
            config.console_enabled = enabled.parse().unwrap_or(true);
        }
        if let Some(json) = vars.get("FED_ETL_LOG_JSON") {
            config.json_format = json.parse().unwrap_or(false);
        }

        config
    }
}

/// Guard that must be kept alive for the duration of the application
/// to ensure proper log flushing
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn build_filter(level: &str, fallback: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(fallback));
    for directive in NOISE_DIRECTIVES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize the global subscriber
///
/// Fails with a configuration error when the log directory cannot be created
/// or a global subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard, ErrorRecord> {
    let mut layers: Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            ErrorRecord::configuration(format!("Failed to create log directory: {}", e))
                .with_context("log_dir", log_dir.display().to_string())
        })?;

        let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        file_guard = Some(guard);

        let file_filter = build_filter(&config.file_log_level, "info");
        let timer = tracing_subscriber::fmt::time::ChronoUtc::new(
            "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
        );
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_timer(timer)
            .with_file(true)
            .with_line_number(true)
            .with_target(true);
        if config.json_format {
            layers.push(file_layer.json().with_filter(file_filter).boxed());
        } else {
            layers.push(file_layer.with_filter(file_filter).boxed());
        }
    }

    if config.console_enabled {
        let console_filter = build_filter(&config.console_log_level, "warn");
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true);
        if config.json_format {
            layers.push(
                console_layer
                    .with_ansi(false)
                    .json()
                    .with_filter(console_filter)
                    .boxed(),
            );
        } else {
            layers.push(console_layer.with_ansi(true).with_filter(console_filter).boxed());
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| {
            ErrorRecord::configuration(format!("Failed to install logging subscriber: {}", e))
        })?;

    info!(
        log_dir = ?config.log_dir,
        json_format = config.json_format,
        console = config.console_enabled,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_dir, None);
        assert_eq!(config.console_log_level, "warn");
        assert!(config.console_enabled);
        assert!(!config.json_format);
    }

    #[test]
    fn test_logging_config_from_vars() {
        let vars: HashMap<String, String> = [
            ("FED_ETL_LOG_DIR", "/tmp/fedetl-logs"),
            ("FED_ETL_LOG_LEVEL", "debug"),
            ("FED_ETL_LOG_JSON", "true"),
            ("FED_ETL_LOG_CONSOLE", "not-a-bool"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = LoggingConfig::from_vars(&vars);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/fedetl-logs")));
        assert_eq!(config.console_log_level, "debug");
        assert_eq!(config.file_log_level, "info");
        assert!(config.json_format);
        assert!(config.console_enabled);
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let filter = build_filter("not a [valid filter", "warn");
        assert!(filter.to_string().contains("warn"));
    }
}
