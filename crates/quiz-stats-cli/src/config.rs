use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use quiz_stats_core::IngestSettings;
use serde::{Deserialize, Serialize};
use time::UtcOffset;

pub const DEFAULT_CONFIG_PATH: &str = "./quiz-stats.toml";

/// Contents of `quiz-stats.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("./quiz_stats.sqlite3"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    /// Offset from UTC used for `last` and display timestamps.
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads the config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read config file {}", path.display())),
        }
    }

    pub fn display_offset(&self) -> Result<UtcOffset> {
        let minutes = self.display.utc_offset_minutes;
        let seconds = minutes
            .checked_mul(60)
            .ok_or_else(|| anyhow!("display.utc_offset_minutes out of range: {minutes}"))?;
        UtcOffset::from_whole_seconds(seconds)
            .with_context(|| format!("display.utc_offset_minutes out of range: {minutes}"))
    }

    pub fn ingest_settings(&self) -> Result<IngestSettings> {
        Ok(IngestSettings {
            display_offset: self.display_offset()?,
        })
    }
}
