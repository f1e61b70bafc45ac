//! Logging setup
//!
//! Structured, async-aware logging with `tracing` and `tracing-subscriber`:
//! - Pretty, compact or JSON output
//! - `RUST_LOG` overrides the configured level (`EnvFilter` syntax)
//! - Level and format taken from [`Settings`]
//!
//! # Example
//! ```no_run
//! use labscan::{config::Settings, logging};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//!
//! info!("Application started");
//! warn!(device = "laser", "Tuning slower than requested");
//! # Ok(())
//! # }
//! ```

use crate::config::settings::Settings;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            )),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Log span close events with their durations (phase timing)
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: false,
            with_ansi: true,
        }
    }
}

impl LogConfig {
    /// Config at `level`, other options default.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from application settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.log_level)?,
            format: settings.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from application settings.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(LogConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Idempotent: when a subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())` and leaves it in place.
pub fn init(config: LogConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize logging: {e}"))
            }
        })
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("verbose").is_err());
        assert_eq!(level_to_filter_string(Level::WARN), "warn");
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            log_level: "debug".into(),
            log_format: "JSON".into(),
            ..Default::default()
        };
        let config = LogConfig::from_settings(&settings).unwrap();
        assert!(matches!(config.level, Level::DEBUG));
        assert_eq!(config.format, OutputFormat::Json);

        let bad = Settings {
            log_format: "xml".into(),
            ..Default::default()
        };
        assert!(LogConfig::from_settings(&bad).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::new(Level::WARN)
            .with_format(OutputFormat::Compact)
            .with_span_events(false)
            .with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
