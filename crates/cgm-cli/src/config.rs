//! Configuration file management.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cgm_core::{CalibrationConfig, ConnectionConfig, StoreConfig};

use crate::cli::OutputFormat;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Database file. Defaults to the platform data directory.
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Default output format: "text", "json" or "csv"
    #[serde(default)]
    pub format: Option<String>,

    /// Disable colored output
    #[serde(default)]
    pub no_color: bool,

    #[serde(default)]
    pub calibration: CalibrationSection,

    #[serde(default)]
    pub connection: ConnectionSection,

    #[serde(default)]
    pub history: HistorySection,

    #[serde(default)]
    pub simulate: SimulateSection,
}

/// Calibration limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSection {
    /// Lowest reportable value in mg/dL.
    #[serde(default = "default_min_glucose")]
    pub min_glucose: f64,

    /// Highest reportable value in mg/dL.
    #[serde(default = "default_max_glucose")]
    pub max_glucose: f64,

    /// Maximum accepted change per minute in mg/dL. 0 disables limiting.
    #[serde(default = "default_allowed_change")]
    pub allowed_change_per_minute: f64,
}

fn default_min_glucose() -> f64 {
    cgm_core::calibration::MIN_READABLE_GLUCOSE
}

fn default_max_glucose() -> f64 {
    cgm_core::calibration::MAX_READABLE_GLUCOSE
}

fn default_allowed_change() -> f64 {
    cgm_core::calibration::DEFAULT_ALLOWED_CHANGE_PER_MINUTE
}

impl Default for CalibrationSection {
    fn default() -> Self {
        Self {
            min_glucose: default_min_glucose(),
            max_glucose: default_max_glucose(),
            allowed_change_per_minute: default_allowed_change(),
        }
    }
}

/// Link timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Seconds between sensor readings.
    #[serde(default = "default_interval")]
    pub reading_interval_secs: u64,

    /// Seconds to wait for a link.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            reading_interval_secs: default_interval(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Glucose history retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySection {
    /// Hours of history kept in memory and restored at startup.
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u32,

    /// Days of history kept in the database. 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_horizon_hours() -> u32 {
    24
}

fn default_retention_days() -> u32 {
    90
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            horizon_hours: default_horizon_hours(),
            retention_days: default_retention_days(),
        }
    }
}

/// Defaults for `cgm simulate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulateSection {
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Sensor age in minutes at the start.
    #[serde(default = "default_start_age")]
    pub start_age: u32,

    /// Time acceleration.
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_seed() -> u64 {
    1
}

fn default_start_age() -> u32 {
    1440
}

fn default_speed() -> f64 {
    60.0
}

impl Default for SimulateSection {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            start_age: default_start_age(),
            speed: default_speed(),
        }
    }
}

/// A configuration field with an invalid value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cgm")
            .join("config.toml")
    }

    /// Load config from the default path, or return default if not found
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Load config from `path`, or return default if missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Check every field; all problems are reported, not just the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Some(format) = &self.format
            && parse_format(format).is_none()
        {
            errors.push(ValidationError::new(
                "format",
                format!("unknown format '{}', expected text, json or csv", format),
            ));
        }

        let c = &self.calibration;
        if !(c.min_glucose.is_finite() && c.min_glucose > 0.0) {
            errors.push(ValidationError::new(
                "calibration.min_glucose",
                "must be greater than 0",
            ));
        }
        if !(c.max_glucose.is_finite() && c.max_glucose > c.min_glucose) {
            errors.push(ValidationError::new(
                "calibration.max_glucose",
                "must be greater than min_glucose",
            ));
        }
        if !(c.allowed_change_per_minute.is_finite() && c.allowed_change_per_minute >= 0.0) {
            errors.push(ValidationError::new(
                "calibration.allowed_change_per_minute",
                "must be 0 (disabled) or positive",
            ));
        }

        if self.connection.reading_interval_secs == 0 {
            errors.push(ValidationError::new(
                "connection.reading_interval_secs",
                "must be at least 1",
            ));
        }
        if self.connection.connect_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "connection.connect_timeout_secs",
                "must be at least 1",
            ));
        }

        if self.history.horizon_hours == 0 {
            errors.push(ValidationError::new(
                "history.horizon_hours",
                "must be at least 1",
            ));
        }

        if !(self.simulate.speed.is_finite() && self.simulate.speed > 0.0) {
            errors.push(ValidationError::new(
                "simulate.speed",
                "must be positive",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Default output format from the config file
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.format.as_deref().and_then(parse_format)
    }

    /// Resolve the database path: explicit flag, then config, then the platform default
    pub fn database_path(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.database.clone())
            .unwrap_or_else(cgm_store::default_db_path)
    }

    pub fn calibration_config(&self) -> CalibrationConfig {
        let c = &self.calibration;
        let builder = CalibrationConfig::builder()
            .min_glucose(c.min_glucose)
            .max_glucose(c.max_glucose);
        if c.allowed_change_per_minute > 0.0 {
            builder
                .allowed_change_per_minute(c.allowed_change_per_minute)
                .build()
        } else {
            builder.no_rate_limit().build()
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .expected_interval(Duration::from_secs(self.connection.reading_interval_secs))
            .connect_timeout(Duration::from_secs(self.connection.connect_timeout_secs))
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::default().glucose_horizon(self.horizon())
    }

    pub fn horizon(&self) -> Duration {
        Duration::from_secs(u64::from(self.history.horizon_hours) * 3600)
    }

    /// Database retention, or `None` to keep everything
    pub fn retention(&self) -> Option<Duration> {
        match self.history.retention_days {
            0 => None,
            days => Some(Duration::from_secs(u64::from(days) * 86_400)),
        }
    }
}

/// Resolve output format: explicit flag, then `--json`, then config, then text
pub fn resolve_format(flag: Option<OutputFormat>, json: bool, config: &Config) -> OutputFormat {
    flag.or(json.then_some(OutputFormat::Json))
        .or_else(|| config.output_format())
        .unwrap_or_default()
}

fn parse_format(s: &str) -> Option<OutputFormat> {
    match s.to_lowercase().as_str() {
        "text" => Some(OutputFormat::Text),
        "json" => Some(OutputFormat::Json),
        "csv" => Some(OutputFormat::Csv),
        _ => None,
    }
}
