use std::path::PathBuf;

use thiserror::Error;

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// A record could not be written to the log. Never swallowed: a dropped
    /// record breaks the append-only guarantee.
    #[error("failed to persist tool call log to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Error type for configuration storage operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read tracker config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write tracker config to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse tracker config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize tracker config for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Export failures are reported as values, never panics.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Error exporting data to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error serializing export: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown time interval '{0}', expected minute, hour or day")]
pub struct UnknownInterval(pub String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unparseable timestamp '{0}'")]
pub struct TimestampParseError(pub String);
