use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::aggregator::Aggregator;
use crate::config::{ConfigStorage, EnvOverrides, StorageOptions, StorageUpdate, TrackerConfig};
use crate::error::{ConfigError, ExportError, MetricsResult};
use crate::interceptor::{Interceptor, ToolFilter};
use crate::storage::DataStore;
use crate::types::{
    DashboardSnapshot, ExportFormat, Interval, StoreStats, ToolCallQuery, ToolCallRecord,
    ToolUsageStats,
};

/// Facade over configuration, the tool call log and its analytic views.
///
/// Dashboards and exporters talk to this type only; they never touch the
/// store directly.
pub struct MetricsApi {
    config_storage: ConfigStorage,
    overrides: EnvOverrides,
    config: Mutex<ConfigState>,
    store: Arc<DataStore>,
    aggregator: Aggregator,
    filter: ToolFilter,
}

/// The config as stored on disk, and the same config with environment
/// overrides applied. Only `file` is ever saved.
struct ConfigState {
    file: TrackerConfig,
    effective: TrackerConfig,
}

impl MetricsApi {
    /// Loads the config at `config_path` (defaults if missing or corrupt),
    /// applies the `TOOL_METRICS_*` environment overrides and opens the log
    /// it points to.
    pub fn open(config_path: impl Into<PathBuf>) -> Self {
        Self::open_with_overrides(config_path, EnvOverrides::from_env())
    }

    pub fn open_with_overrides(config_path: impl Into<PathBuf>, overrides: EnvOverrides) -> Self {
        let config_storage = ConfigStorage::new(config_path);
        let config = config_storage.load_or_default();
        let effective = overrides.effective(&config);

        let store = Arc::new(DataStore::open_file(
            effective.storage.path.clone(),
            effective.storage.max_entries,
        ));
        Self::assemble(config_storage, config, overrides, store)
    }

    /// Uses `config` as both the file and the effective config.
    pub fn from_parts(
        config_storage: ConfigStorage,
        config: TrackerConfig,
        store: Arc<DataStore>,
    ) -> Self {
        Self::assemble(config_storage, config, EnvOverrides::default(), store)
    }

    fn assemble(
        config_storage: ConfigStorage,
        config: TrackerConfig,
        overrides: EnvOverrides,
        store: Arc<DataStore>,
    ) -> Self {
        let effective = overrides.effective(&config);
        let filter = ToolFilter::from_flags(&effective.tools_to_track);
        let aggregator = Aggregator::new(Arc::clone(&store));
        Self {
            config_storage,
            overrides,
            config: Mutex::new(ConfigState {
                file: config,
                effective,
            }),
            store,
            aggregator,
            filter,
        }
    }

    /// An interceptor writing to this facade's log and honouring its tool
    /// tracking switches.
    pub fn interceptor(&self) -> Interceptor {
        Interceptor::with_filter(Arc::clone(&self.store), self.filter.clone())
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Effective config, environment overrides included.
    pub fn config(&self) -> TrackerConfig {
        self.config.lock().effective.clone()
    }

    pub fn tool_tracking(&self) -> BTreeMap<String, bool> {
        self.config.lock().effective.tools_to_track.clone()
    }

    pub fn configure_tool_tracking<I, S>(&self, updates: I) -> Result<BTreeMap<String, bool>, ConfigError>
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let tools = self
            .update_config(|config| {
                for (tool_name, enabled) in updates {
                    config.tools_to_track.insert(tool_name.into(), enabled);
                }
            })?
            .tools_to_track;
        self.filter.replace(&tools);
        Ok(tools)
    }

    pub fn visualization_options(&self) -> Map<String, Value> {
        self.config.lock().effective.visualization.clone()
    }

    pub fn set_visualization_options(
        &self,
        updates: Map<String, Value>,
    ) -> Result<Map<String, Value>, ConfigError> {
        self.update_config(|config| config.visualization.extend(updates))
            .map(|config| config.visualization)
    }

    pub fn storage_options(&self) -> StorageOptions {
        self.config.lock().effective.storage.clone()
    }

    /// `max_entries` applies to the open log right away; a new `path` is used
    /// the next time the facade is opened. Returns the effective options, so
    /// an environment override still wins over the update.
    pub fn set_storage_options(&self, update: StorageUpdate) -> Result<StorageOptions, ConfigError> {
        let storage = self
            .update_config(|config| {
                if let Some(path) = update.path {
                    config.storage.path = path;
                }
                if let Some(max_entries) = update.max_entries {
                    config.storage.max_entries = max_entries;
                }
            })?
            .storage;

        self.store.set_max_entries(storage.max_entries);
        if storage.path != self.store.location() {
            log::info!(
                "tool call log path set to {}; reopen to switch from {}",
                storage.path.display(),
                self.store.location().display()
            );
        }
        Ok(storage)
    }

    /// Dashboard data. Passing an interval or a tool filter recomputes the
    /// time series with them (hour by default).
    pub fn dashboard_data(
        &self,
        interval: Option<Interval>,
        tool_filter: Option<&[String]>,
    ) -> DashboardSnapshot {
        self.aggregator
            .dashboard(interval.unwrap_or_default(), tool_filter)
    }

    /// Writes an export and returns its path. Without `output_path` the file
    /// is named `tool_calls_export_<YYYYmmdd_HHMMSS>.<ext>`.
    pub fn export_data(&self, format: &str, output_path: Option<&Path>) -> Result<PathBuf, ExportError> {
        let format: ExportFormat = format.parse()?;
        let content = self.aggregator.export_to_columnar(format)?;

        let path = match output_path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(default_export_filename(format)),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ExportError::Write {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        fs::write(&path, content).map_err(|source| ExportError::Write {
            path: path.clone(),
            source,
        })?;

        log::info!("exported tool calls to {}", path.display());
        Ok(path)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn tool_usage_stats(&self) -> BTreeMap<String, ToolUsageStats> {
        self.store.tool_usage_stats()
    }

    pub fn query(&self, query: &ToolCallQuery) -> Vec<ToolCallRecord> {
        self.store.query(query)
    }

    pub fn clear(&self) -> MetricsResult<()> {
        self.store.clear()
    }

    /// Applies `change` to a copy of the file config and only keeps it once
    /// it has been written. Returns the new effective config.
    fn update_config(&self, change: impl FnOnce(&mut TrackerConfig)) -> Result<TrackerConfig, ConfigError> {
        let mut state = self.config.lock();
        let mut file = state.file.clone();
        change(&mut file);
        self.config_storage.save(&file)?;

        state.effective = self.overrides.effective(&file);
        state.file = file;
        Ok(state.effective.clone())
    }
}

fn default_export_filename(format: ExportFormat) -> String {
    format!(
        "tool_calls_export_{}.{}",
        Local::now().format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}
