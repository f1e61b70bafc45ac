//! Application settings using Figment
//!
//! Settings are layered, later sources winning:
//! 1. Built-in defaults
//! 2. `labscan.toml` (or the file passed to [`Settings::load_from`])
//! 3. Environment variables prefixed with `LABSCAN_`
//!
//! # Example
//! ```no_run
//! use labscan::config::settings::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Detector timeout: {:?}", settings.read_timeout());
//! # Ok::<(), labscan::error::LabError>(())
//! ```

use crate::error::AppResult;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file, looked up in the working directory.
pub const SETTINGS_FILE: &str = "labscan.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LABSCAN_";

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: pretty, compact, json
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Per-read detector timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Settle time after each write when a scan does not set its own
    #[serde(default)]
    pub settle_ms: u64,
    /// Where `run` writes result files when no explicit output is given
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_read_timeout_ms() -> u64 {
    2_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            read_timeout_ms: default_read_timeout_ms(),
            settle_ms: 0,
            output_dir: None,
        }
    }
}

impl Settings {
    /// Load from `labscan.toml` and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Example: `LABSCAN_READ_TIMEOUT_MS=500`
    pub fn load() -> AppResult<Self> {
        Self::load_from(SETTINGS_FILE)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.read_timeout_ms == 0 {
            return Err("read_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Per-read detector timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Default settle time.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        let settings = Settings::load_from("/nonexistent/labscan.toml").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_ok());
        assert_eq!(settings.read_timeout(), Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"debug\"\nread_timeout_ms = 750\nsettle_ms = 20").unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.read_timeout_ms, 750);
        assert_eq!(settings.settle(), Duration::from_millis(20));

        std::env::set_var("LABSCAN_READ_TIMEOUT_MS", "300");
        let settings = Settings::load_from(file.path());
        std::env::remove_var("LABSCAN_READ_TIMEOUT_MS");
        assert_eq!(settings.unwrap().read_timeout_ms, 300);
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        settings.log_level = "loud".into();
        assert!(settings.validate().unwrap_err().contains("log_level"));

        let mut settings = Settings::default();
        settings.log_format = "xml".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.read_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }
}
