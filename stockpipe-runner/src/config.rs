//! Application configuration loaded from `stockpipe.toml`.
//!
//! Every section is optional in the file; missing keys take the defaults
//! below. [`AppConfig::validate`] is the single gate the crawler calls before
//! touching any collaborator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use stockpipe_core::market::{PageSize, SsiSettings, MIN_COOL_DOWN};
use stockpipe_core::schema::DEFAULT_DATABASE;
use stockpipe_core::store::SqlServerSettings;
use stockpipe_core::timeseries::InfluxSettings;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stockpipe.toml";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cool-down of {millis} ms is too short; the API needs more than {} ms between calls", MIN_COOL_DOWN.as_millis())]
    CoolDownTooShort { millis: u64 },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("{} already exists (use --force to overwrite)", .0.display())]
    AlreadyExists(PathBuf),
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub ssi: SsiSettings,

    /// SQL Server connection.
    #[serde(default)]
    pub relational: SqlServerSettings,

    #[serde(default)]
    pub time_series: TimeSeriesConfig,

    #[serde(default)]
    pub crawl: CrawlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Database holding the reference, entity and checkpoint tables.
    pub database: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.into(),
        }
    }
}

/// InfluxDB connection plus where the daily bars land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSeriesConfig {
    pub url: String,
    pub org: String,
    pub token: String,
    pub bucket: String,
    pub measurement: String,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        let influx = InfluxSettings::default();
        Self {
            url: influx.url,
            org: influx.org,
            token: influx.token,
            bucket: "root".into(),
            measurement: "ssi_stocks".into(),
        }
    }
}

impl TimeSeriesConfig {
    pub fn influx(&self) -> InfluxSettings {
        InfluxSettings {
            url: self.url.clone(),
            org: self.org.clone(),
            token: self.token.clone(),
        }
    }
}

/// Crawl behaviour: windowing, paging, pacing and stage switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// First window start when no usable checkpoint exists.
    pub default_start: NaiveDate,

    /// Length of one time window in days.
    pub window_days: u32,

    pub page_size: PageSize,

    /// Pause after every API call, in milliseconds. Must exceed 1000.
    pub cool_down_ms: u64,

    /// Seed reference tables and refresh the entity table.
    pub enable_relational: bool,

    /// Crawl daily bars into the time-series store.
    pub enable_time_series: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            default_start: NaiveDate::from_ymd_opt(2020, 2, 1).unwrap_or(NaiveDate::MIN),
            window_days: 30,
            page_size: PageSize::Thousand,
            cool_down_ms: 1100,
            enable_relational: true,
            enable_time_series: true,
        }
    }
}

impl CrawlConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

const TEMPLATE: &str = r#"# stockpipe configuration

[general]
database = "SSI_STOCKS"

[ssi]
base_url = "https://fc-data.ssi.com.vn/"
consumer_id = ""
consumer_secret = ""

[relational]
server = "localhost"
port = 1433
login = "sa"
password = ""
trust_cert = true

[time_series]
url = "http://localhost:8086"
org = ""
token = ""
bucket = "root"
measurement = "ssi_stocks"

[crawl]
default_start = "2020-02-01"
window_days = 30
# One of 10, 20, 50, 100, 1000.
page_size = 1000
# Pause after every API call; must be more than 1000.
cool_down_ms = 1100
enable_relational = true
enable_time_series = true
"#;

impl AppConfig {
    /// Sample configuration file with every key at its default.
    pub fn template() -> &'static str {
        TEMPLATE
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a config file. Validation is left to the caller.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Write the template to `path`, refusing to replace a file unless `force`.
    pub fn write_template(path: &Path, force: bool) -> Result<(), ConfigError> {
        if path.exists() && !force {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        std::fs::write(path, TEMPLATE).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.crawl.cool_down() <= MIN_COOL_DOWN {
            return Err(ConfigError::CoolDownTooShort {
                millis: self.crawl.cool_down_ms,
            });
        }
        if self.crawl.window_days == 0 {
            return Err(ConfigError::invalid("crawl.window_days", "must be at least 1"));
        }
        let database = self.general.database.trim();
        if database.is_empty() {
            return Err(ConfigError::invalid("general.database", "must not be empty"));
        }
        if database.len() > 128 {
            return Err(ConfigError::invalid(
                "general.database",
                "longer than 128 characters",
            ));
        }
        if self.crawl.enable_time_series {
            if self.time_series.bucket.trim().is_empty() {
                return Err(ConfigError::invalid("time_series.bucket", "must not be empty"));
            }
            if self.time_series.measurement.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "time_series.measurement",
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }
}
