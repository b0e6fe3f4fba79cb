//! Persisted tracker configuration.
//!
//! The config file holds tool tracking switches, opaque visualization
//! defaults and storage options. A missing or damaged file never stops the
//! tracker from starting: it falls back to defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILENAME: &str = "pow_config.json";
pub const DEFAULT_STORAGE_PATH: &str = "tool_calls_db.json";
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

pub const STORAGE_PATH_ENV: &str = "TOOL_METRICS_STORAGE_PATH";
pub const MAX_ENTRIES_ENV: &str = "TOOL_METRICS_MAX_ENTRIES";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub tools_to_track: BTreeMap<String, bool>,
    /// Passed through to dashboards untouched.
    #[serde(default = "default_visualization")]
    pub visualization: Map<String, Value>,
    #[serde(default)]
    pub storage: StorageOptions,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tools_to_track: BTreeMap::new(),
            visualization: default_visualization(),
            storage: StorageOptions::default(),
        }
    }
}

impl TrackerConfig {
    /// Applies the `TOOL_METRICS_*` environment variables. Callers that save
    /// the config should keep an unmodified copy to write back.
    pub fn apply_env_overrides(&mut self) {
        EnvOverrides::from_env().apply(self);
    }
}

/// Storage settings taken from the environment. They win over the file and
/// are never written back to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub storage_path: Option<PathBuf>,
    pub max_entries: Option<usize>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides through `lookup`; an unparseable max entries value is
    /// ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let storage_path = lookup(STORAGE_PATH_ENV)
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let max_entries = lookup(MAX_ENTRIES_ENV).and_then(|raw| match raw.trim().parse::<usize>() {
            Ok(max_entries) => Some(max_entries),
            Err(error) => {
                log::warn!("ignoring {}={}: {}", MAX_ENTRIES_ENV, raw, error);
                None
            }
        });
        Self {
            storage_path,
            max_entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.storage_path.is_none() && self.max_entries.is_none()
    }

    pub fn apply(&self, config: &mut TrackerConfig) {
        if let Some(path) = &self.storage_path {
            config.storage.path = path.clone();
        }
        if let Some(max_entries) = self.max_entries {
            config.storage.max_entries = Some(max_entries);
        }
    }

    /// `config` with these overrides applied.
    pub fn effective(&self, config: &TrackerConfig) -> TrackerConfig {
        let mut effective = config.clone();
        self.apply(&mut effective);
        effective
    }
}

fn default_visualization() -> Map<String, Value> {
    match json!({ "default_interval": "hour", "theme": "light" }) {
        Value::Object(options) => options,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_entries")]
    pub max_entries: Option<usize>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_max_entries() -> Option<usize> {
    Some(DEFAULT_MAX_ENTRIES)
}

/// Partial update of [`StorageOptions`]; `None` fields are left alone.
///
/// `max_entries: Some(None)` removes the retention bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(
        default,
        deserialize_with = "present_field",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_entries: Option<Option<usize>>,
}

/// Keeps an explicit `null` apart from a missing field.
fn present_field<'de, D>(deserializer: D) -> Result<Option<Option<usize>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<usize>::deserialize(deserializer).map(Some)
}

/// Loads and saves the tracker config file.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(None)` if the file doesn't exist or is empty.
    pub fn load(&self) -> Result<Option<TrackerConfig>, ConfigError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Falls back to defaults when the file is missing, unreadable or corrupt.
    pub fn load_or_default(&self) -> TrackerConfig {
        match self.load() {
            Ok(Some(config)) => config,
            Ok(None) => TrackerConfig::default(),
            Err(error) => {
                log::warn!("{}; using default tracker config", error);
                TrackerConfig::default()
            }
        }
    }

    pub fn save(&self, config: &TrackerConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: self.path.clone(),
                    source,
                })?;
            }
        }

        let content =
            serde_json::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
                path: self.path.clone(),
                source,
            })?;

        fs::write(&self.path, content).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// `<config dir>/tool-metrics/pow_config.json`, if the platform has a config
/// directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config_dir| config_dir.join("tool-metrics").join(DEFAULT_CONFIG_FILENAME))
}
