//! Telemetry configuration and management

use crate::enrichment::DEFAULT_FOREIGN_MARKERS;
use crate::event::Level;
use crate::{Error, Result};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Global enable/disable toggle
    pub enabled: bool,

    /// Identity stamped on every event
    pub service: ServiceConfig,

    /// Output configuration
    pub logging: LoggingConfig,

    /// Daily rotation and retention
    pub rotation: RotationConfig,

    /// Error location inference
    pub enrichment: EnrichmentConfig,

    /// Unit-of-work instrumentation
    pub requests: RequestConfig,
}

/// Service identity fields
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Value of the `service` field
    pub name: String,

    /// Value of the `environment` field
    pub environment: String,
}

/// Logging-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Events below this level are skipped
    pub min_level: Level,

    /// Enable console (stdout) output
    pub console_enabled: bool,

    /// Enable file output
    pub file_enabled: bool,

    /// Directory for log files
    pub log_dir: PathBuf,

    /// Directory used once at startup when `log_dir` is not writable
    pub fallback_log_dir: PathBuf,

    /// Base filename for logs (`<base>.log`, `<base>-<date>.log`)
    pub log_file_name: String,

    /// Reference time zone for timestamps and the rotation boundary
    pub timezone: String,

    /// Install the pipeline as the global `tracing` subscriber
    pub install_tracing_bridge: bool,
}

/// Log rotation and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Time of day (`HH:MM`, reference zone) at which the active file is rotated
    pub boundary: String,

    /// Number of rotated files to keep
    pub retention_files: u32,
}

/// Error enrichment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Attach the full formatted stack trace to error events
    pub capture_stack: bool,

    /// Path fragments marking dependency or standard-library frames
    pub foreign_markers: Vec<String>,

    /// Root used to rewrite blame file paths as relative paths
    pub app_root: Option<PathBuf>,
}

/// Request and task instrumentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Requests slower than this emit `slow_request_detected`
    pub slow_request_threshold_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let default_log_dir = Self::default_log_dir().unwrap_or_else(|_| PathBuf::from("./logs"));

        Self {
            enabled: true,
            service: ServiceConfig {
                name: "quill-service".to_string(),
                environment: "development".to_string(),
            },
            logging: LoggingConfig {
                min_level: Level::Info,
                console_enabled: true,
                file_enabled: true,
                log_dir: default_log_dir,
                fallback_log_dir: PathBuf::from("./logs"),
                log_file_name: "app".to_string(),
                timezone: "UTC".to_string(),
                install_tracing_bridge: false,
            },
            rotation: RotationConfig {
                boundary: "00:00".to_string(),
                retention_files: 7,
            },
            enrichment: EnrichmentConfig::default(),
            requests: RequestConfig {
                slow_request_threshold_ms: 1000,
            },
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            capture_stack: true,
            foreign_markers: DEFAULT_FOREIGN_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            app_root: std::env::current_dir().ok(),
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from file or create default
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            let config: TelemetryConfig = toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse telemetry config: {}", e),
            })?;
            Ok(config)
        } else {
            let mut config = Self::default();
            config.load_env_overrides();
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("Failed to serialize telemetry config: {}", e),
        })?;

        tokio::fs::write(&config_file, content).await?;
        Ok(())
    }

    /// Load environment variable overrides
    pub fn load_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("QUILL_TELEMETRY_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
        }

        if let Ok(name) = std::env::var("QUILL_SERVICE_NAME") {
            self.service.name = name;
        }

        if let Ok(environment) = std::env::var("QUILL_ENVIRONMENT") {
            self.service.environment = environment;
        }

        if let Ok(level) = std::env::var("QUILL_LOG_LEVEL") {
            self.logging.min_level = level.parse().unwrap_or(self.logging.min_level);
        }

        if let Ok(dir) = std::env::var("QUILL_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }

        if let Ok(timezone) = std::env::var("QUILL_TIMEZONE") {
            self.logging.timezone = timezone;
        }

        if let Ok(count) = std::env::var("QUILL_RETENTION_FILES") {
            self.rotation.retention_files = count.parse().unwrap_or(self.rotation.retention_files);
        }

        if let Ok(root) = std::env::var("QUILL_APP_ROOT") {
            self.enrichment.app_root = Some(PathBuf::from(root));
        }

        if let Ok(capture) = std::env::var("QUILL_CAPTURE_STACK") {
            self.enrichment.capture_stack = capture.parse().unwrap_or(self.enrichment.capture_stack);
        }
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "quill", "quill").ok_or_else(|| Error::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("telemetry.toml"))
    }

    /// Get default log directory
    fn default_log_dir() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "quill", "quill").ok_or_else(|| Error::Config {
                message: "Could not determine log directory".to_string(),
            })?;

        Ok(project_dirs.data_dir().join("logs"))
    }

    /// Path of the active log file
    pub fn log_file_path(&self) -> PathBuf {
        self.logging
            .log_dir
            .join(format!("{}.log", self.logging.log_file_name))
    }

    /// Parsed reference time zone
    pub fn time_zone(&self) -> Result<TimeZoneSetting> {
        self.logging.timezone.parse()
    }

    /// Parsed rotation boundary
    pub fn rotation_boundary(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(self.rotation.boundary.trim(), "%H:%M").map_err(|e| {
            Error::Config {
                message: format!(
                    "Invalid rotation boundary '{}': {}",
                    self.rotation.boundary, e
                ),
            }
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.time_zone()?;
        self.rotation_boundary()?;

        if self.rotation.retention_files == 0 {
            return Err(Error::Config {
                message: "retention_files must be greater than 0".to_string(),
            });
        }

        if self.logging.log_file_name.trim().is_empty() {
            return Err(Error::Config {
                message: "log_file_name must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Fixed-offset reference time zone (`UTC`, `Z`, `+09:00`, `-0530`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeZoneSetting(FixedOffset);

impl TimeZoneSetting {
    pub fn utc() -> Self {
        Self(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.0
    }
}

impl Default for TimeZoneSetting {
    fn default() -> Self {
        Self::utc()
    }
}

impl FromStr for TimeZoneSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" || trimmed.is_empty() {
            return Ok(Self::utc());
        }

        let invalid = || Error::Config {
            message: format!("Invalid timezone '{}': expected UTC or +HH:MM", s),
        };

        let (sign, rest) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            _ => return Err(invalid()),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
        let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
        if minutes >= 60 {
            return Err(invalid());
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self)
            .ok_or_else(invalid)
    }
}
