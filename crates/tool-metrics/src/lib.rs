pub mod aggregator;
pub mod api;
pub mod args;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod storage;
pub mod types;

pub use aggregator::Aggregator;
pub use api::MetricsApi;
pub use args::{Named, ToolArgs};
pub use config::{
    default_config_path, ConfigStorage, EnvOverrides, StorageOptions, StorageUpdate, TrackerConfig,
};
pub use error::{ConfigError, ExportError, MetricsError, MetricsResult};
pub use interceptor::{Interceptor, Measured, ToolFilter};
pub use storage::{DataStore, JsonFileBackend, LogBackend};
pub use types::{
    DashboardSnapshot, Dataset, ExportFormat, Interval, LatencyStats, LogDocument,
    PendingToolCall, StoreMetadata, StoreStats, SuccessRateStats, TimeSeries, ToolArguments,
    ToolCallQuery, ToolCallRecord, ToolOutcome, ToolUsageStats,
};
