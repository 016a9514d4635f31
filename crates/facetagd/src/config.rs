use facetag_azure::{normalize_endpoint, AzureConfig, FileRoots, RetryPolicy, DEFAULT_PERSON_GROUP};
use facetag_core::Settings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Settings(#[from] facetag_core::ConfigError),
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    Session,
    System,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AzureSection {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_person_group")]
    pub person_group_id: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AzureSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            person_group_id: default_person_group(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Backoff for transient HTTP failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub backoff_coefficient: u32,
    pub initial_interval_ms: u64,
    pub maximum_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval_ms: 1000,
            maximum_interval_ms: 30_000,
            max_attempts: 3,
        }
    }
}

/// Draining of the deferred work queues.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Seconds between cron ticks; 0 disables the tick.
    pub cron_interval_secs: u64,
    /// Items processed per queue per tick.
    pub budget: usize,
    /// Failed attempts before an item is dropped.
    pub max_attempts: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            cron_interval_secs: 60,
            budget: 50,
            max_attempts: 5,
        }
    }
}

/// Daemon configuration: a TOML file plus `FACETAG_*` overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub azure: AzureSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub queue: QueueSection,
    pub settings: Settings,
    /// URI scheme → directory, e.g. `public = "/var/www/files"`.
    #[serde(default)]
    pub files: FileRoots,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_bus")]
    pub bus: Bus,
}

fn default_person_group() -> String {
    DEFAULT_PERSON_GROUP.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_bus() -> Bus {
    Bus::Session
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

fn default_db_path() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join("facetag").join("facetag.db")
}

/// `FACETAG_CONFIG`, or `$XDG_CONFIG_HOME/facetag/config.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var("FACETAG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| xdg_dir("XDG_CONFIG_HOME", ".config").join("facetag").join("config.toml"))
}

impl Config {
    /// Load from the default path, apply environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACETAG_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACETAG_ENDPOINT") {
            self.azure.endpoint = v;
        }
        if let Some(v) = lookup("FACETAG_API_KEY") {
            self.azure.api_key = v;
        }
        if let Some(v) = lookup("FACETAG_PERSON_GROUP") {
            self.azure.person_group_id = v;
        }
        if let Some(v) = lookup("FACETAG_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACETAG_BUS") {
            self.bus = match v.as_str() {
                "session" => Bus::Session,
                "system" => Bus::System,
                _ => return Err(ConfigError::Invalid { key: "FACETAG_BUS", value: v.clone() }),
            };
        }
        if let Some(v) = lookup("FACETAG_CRON_SECS") {
            self.queue.cron_interval_secs = v.parse().map_err(|_| ConfigError::Invalid {
                key: "FACETAG_CRON_SECS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("FACETAG_SYNCHRONOUS") {
            self.settings.synchronous = v != "0";
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.azure.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("azure.endpoint"));
        }
        if self.azure.api_key.is_empty() {
            return Err(ConfigError::Missing("azure.api_key"));
        }
        self.azure.endpoint = normalize_endpoint(&self.azure.endpoint);
        self.settings.validate()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry.backoff_coefficient,
            Duration::from_millis(self.retry.initial_interval_ms),
        )
        .maximum_interval(Duration::from_millis(self.retry.maximum_interval_ms))
        .max_attempts(self.retry.max_attempts)
        .provide()
    }

    pub fn azure_config(&self) -> AzureConfig {
        AzureConfig {
            endpoint: self.azure.endpoint.clone(),
            api_key: self.azure.api_key.clone(),
            person_group_id: self.azure.person_group_id.clone(),
            timeout: Duration::from_secs(self.azure.timeout_secs),
            retry: self.retry_policy(),
            file_roots: self.files.clone(),
        }
    }
}
