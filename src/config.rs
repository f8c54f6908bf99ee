use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::orchestrator::FailurePolicy;

pub const ENV_RUN_SERVICE: &str = "CRM_MIRROR_RUN_SERVICE";
pub const ENV_POLL_INTERVAL_SECS: &str = "CRM_MIRROR_POLL_INTERVAL_SECS";
pub const ENV_TARGET_URL: &str = "CRM_MIRROR_TARGET_URL";
pub const ENV_SOURCE_URL: &str = "CRM_MIRROR_SOURCE_URL";
pub const ENV_SOURCE_TOKEN: &str = "CRM_MIRROR_SOURCE_TOKEN";
pub const ENV_DATA_DIR: &str = "CRM_MIRROR_DATA_DIR";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_SCOPE_KEY: &str = "default";
const DEFAULT_PAGE_SIZE: u32 = 5000;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    fn default(value: T) -> Self {
        Self::new(value, ConfigSource::Default)
    }
}

/// Remote source (Dataverse Web API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Web API base URL (e.g. "https://org.crm.dynamics.com/api/data/v9.2")
    pub url: Option<String>,
    /// Static bearer token
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// Change feed consumer namespace
    pub scope_key: String,
    /// Preferred number of changes per page
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            access_token: None,
            scope_key: DEFAULT_SCOPE_KEY.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Enables the sync service
    pub run_service: ConfigValue<bool>,
    /// Seconds between polls
    pub poll_interval_secs: ConfigValue<u64>,
    /// Entity types to mirror
    pub entity_types: ConfigValue<Vec<String>>,
    /// Process entity types of one tick in parallel
    pub process_entity_types_concurrently: ConfigValue<bool>,
    /// Upper bound on parallel entity types; none means all
    pub max_parallelism: ConfigValue<Option<usize>>,
    /// Skip rows that violate unique constraints instead of failing the batch
    pub ignore_invalid_data: ConfigValue<bool>,
    /// What a failed entity type does to the rest of the run
    pub failure_policy: ConfigValue<FailurePolicy>,
    /// Target store (`sqlite:<path>` or `postgres://...`)
    pub target_connection_string: ConfigValue<String>,
    /// Directory for watermarks and the default SQLite target
    pub data_dir: ConfigValue<PathBuf>,
    /// Source configuration
    pub source: SourceConfig,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    run_service: Option<bool>,
    poll_interval_secs: Option<u64>,
    entity_types: Option<Vec<String>>,
    process_entity_types_concurrently: Option<bool>,
    max_parallelism: Option<usize>,
    ignore_invalid_data: Option<bool>,
    failure_policy: Option<FailurePolicy>,
    target_connection_string: Option<String>,
    data_dir: Option<PathBuf>,
    source: Option<SourceConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with_env(config_path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`], reading environment overrides through `env`.
    pub fn load_with_env(
        config_path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut run_service = ConfigValue::default(true);
        let mut poll_interval_secs = ConfigValue::default(DEFAULT_POLL_INTERVAL_SECS);
        let mut entity_types = ConfigValue::default(Vec::new());
        let mut process_entity_types_concurrently = ConfigValue::default(false);
        let mut max_parallelism = ConfigValue::default(None);
        let mut ignore_invalid_data = ConfigValue::default(false);
        let mut failure_policy = ConfigValue::default(FailurePolicy::default());
        let mut target_connection_string: Option<ConfigValue<String>> = None;
        let mut data_dir = ConfigValue::default(Self::default_data_dir());
        let mut source = SourceConfig::default();
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            let from_file = |value| ConfigValue::new(value, ConfigSource::File);
            if let Some(v) = file_config.run_service {
                run_service = from_file(v);
            }
            if let Some(v) = file_config.poll_interval_secs {
                poll_interval_secs = ConfigValue::new(v, ConfigSource::File);
            }
            if let Some(v) = file_config.entity_types {
                entity_types = ConfigValue::new(v, ConfigSource::File);
            }
            if let Some(v) = file_config.process_entity_types_concurrently {
                process_entity_types_concurrently = from_file(v);
            }
            if let Some(v) = file_config.max_parallelism {
                max_parallelism = ConfigValue::new(Some(v), ConfigSource::File);
            }
            if let Some(v) = file_config.ignore_invalid_data {
                ignore_invalid_data = from_file(v);
            }
            if let Some(v) = file_config.failure_policy {
                failure_policy = ConfigValue::new(v, ConfigSource::File);
            }
            if let Some(v) = file_config.target_connection_string {
                target_connection_string = Some(ConfigValue::new(v, ConfigSource::File));
            }
            if let Some(dir) = file_config.data_dir {
                data_dir = ConfigValue::new(resolve_relative(&path, dir), ConfigSource::File);
            }
            if let Some(v) = file_config.source {
                source = v;
            }
        }

        // Apply environment variable overrides
        if let Some(v) = env(ENV_RUN_SERVICE) {
            run_service = ConfigValue::new(parse_bool(ENV_RUN_SERVICE, &v)?, ConfigSource::Environment);
        }
        if let Some(v) = env(ENV_POLL_INTERVAL_SECS) {
            let secs = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_POLL_INTERVAL_SECS.to_string(),
                value: v.clone(),
            })?;
            poll_interval_secs = ConfigValue::new(secs, ConfigSource::Environment);
        }
        if let Some(v) = env(ENV_TARGET_URL) {
            target_connection_string = Some(ConfigValue::new(v, ConfigSource::Environment));
        }
        if let Some(v) = env(ENV_DATA_DIR) {
            data_dir = ConfigValue::new(PathBuf::from(v), ConfigSource::Environment);
        }
        if let Some(v) = env(ENV_SOURCE_URL) {
            source.url = Some(v);
        }
        if let Some(v) = env(ENV_SOURCE_TOKEN) {
            source.access_token = Some(v);
        }

        // The default target lives in the final data directory.
        let target_connection_string = target_connection_string.unwrap_or_else(|| {
            ConfigValue::default(format!(
                "sqlite:{}",
                data_dir.value.join("mirror.db").display()
            ))
        });

        Ok(Self {
            run_service,
            poll_interval_secs,
            entity_types,
            process_entity_types_concurrently,
            max_parallelism,
            ignore_invalid_data,
            failure_policy,
            target_connection_string,
            data_dir,
            source,
            config_file,
        })
    }

    /// Checks values that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs.value == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_parallelism.value == Some(0) {
            return Err(ConfigError::Invalid(
                "max_parallelism must be greater than zero".to_string(),
            ));
        }
        if self.source.page_size == 0 {
            return Err(ConfigError::Invalid(
                "source.page_size must be greater than zero".to_string(),
            ));
        }
        if self.run_service.value {
            if self.entity_types.value.is_empty() {
                return Err(ConfigError::Invalid(
                    "entity_types must list at least one entity type".to_string(),
                ));
            }
            if self.source.url.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "source.url is required (or set {})",
                    ENV_SOURCE_URL
                )));
            }
        }
        Ok(())
    }

    /// Number of entity types processed at once within a tick.
    pub fn parallelism(&self) -> usize {
        if !self.process_entity_types_concurrently.value {
            return 1;
        }
        self.max_parallelism
            .value
            .unwrap_or(self.entity_types.value.len())
            .max(1)
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/crm-mirror/
    /// - macOS: ~/Library/Application Support/crm-mirror/
    /// - Windows: %APPDATA%/crm-mirror/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crm-mirror")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/crm-mirror/
    /// - macOS: ~/Library/Application Support/crm-mirror/
    /// - Windows: %APPDATA%/crm-mirror/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crm-mirror")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

/// Resolve relative paths against the config file's directory
fn resolve_relative(config_path: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        config_path
            .parent()
            .map(|p| p.join(&path))
            .unwrap_or(path)
    } else {
        path
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    ReadError(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, #[source] serde_yaml::Error),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
