use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ExportError, TimestampParseError, UnknownInterval};

/// Ordered parameter name -> value mapping. Positional arguments are named
/// `arg0..argN`.
pub type ToolArguments = Map<String, Value>;

pub const LOG_FORMAT_VERSION: &str = "1.0.0";

const FAILURE_KEY: &str = "__failure__";
const SUCCESS_KEY: &str = "__success__";

/// Outcome of one tool invocation.
///
/// Serialized as the bare success value, or as
/// `{"__failure__": {"type": .., "message": ..}}` for failures, so a
/// legitimate `null` return stays a success.
///
/// `__failure__` and `__success__` are reserved: a success value that is a
/// single-key object under either key is written as
/// `{"__success__": <value>}` and unwrapped again on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ToolOutcome {
    Success(Value),
    Failure { error_type: String, message: String },
}

impl ToolOutcome {
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success(value.into())
    }

    pub fn failure(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }
}

impl From<Value> for ToolOutcome {
    fn from(value: Value) -> Self {
        if let Value::Object(object) = &value {
            if object.len() == 1 {
                if let Some(escaped) = object.get(SUCCESS_KEY) {
                    return Self::Success(escaped.clone());
                }
                if let Some(Value::Object(marker)) = object.get(FAILURE_KEY) {
                    let field = |key: &str| {
                        marker
                            .get(key)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    return Self::Failure {
                        error_type: field("type"),
                        message: field("message"),
                    };
                }
            }
        }
        Self::Success(value)
    }
}

impl From<ToolOutcome> for Value {
    fn from(outcome: ToolOutcome) -> Self {
        match outcome {
            ToolOutcome::Success(value) if is_reserved_shape(&value) => {
                let mut object = Map::new();
                object.insert(SUCCESS_KEY.to_string(), value);
                Value::Object(object)
            }
            ToolOutcome::Success(value) => value,
            ToolOutcome::Failure {
                error_type,
                message,
            } => {
                let mut object = Map::new();
                object.insert(
                    FAILURE_KEY.to_string(),
                    json!({ "type": error_type, "message": message }),
                );
                Value::Object(object)
            }
        }
    }
}

fn is_reserved_shape(value: &Value) -> bool {
    match value {
        Value::Object(object) if object.len() == 1 => {
            object.contains_key(FAILURE_KEY) || object.contains_key(SUCCESS_KEY)
        }
        _ => false,
    }
}

/// One measured invocation of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Assigned by the store on append; 0 until then.
    #[serde(default)]
    pub id: u64,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
    pub result: ToolOutcome,
    pub timestamp: String,
    #[serde(default)]
    pub execution_time: Option<f64>,
}

impl ToolCallRecord {
    pub fn new(tool_name: impl Into<String>, arguments: ToolArguments, result: ToolOutcome) -> Self {
        Self {
            id: 0,
            tool_name: tool_name.into(),
            arguments,
            result,
            timestamp: now_timestamp(),
            execution_time: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_execution_time(mut self, seconds: Option<f64>) -> Self {
        self.execution_time = seconds;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

/// A call that has started but not finished. Only `finish` turns it into a
/// record, so a half-filled record can never reach the store.
#[derive(Debug)]
pub struct PendingToolCall {
    tool_name: String,
    arguments: ToolArguments,
    timestamp: String,
}

impl PendingToolCall {
    pub fn open(tool_name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            timestamp: now_timestamp(),
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn finish(self, result: ToolOutcome, elapsed: Duration) -> ToolCallRecord {
        ToolCallRecord {
            id: 0,
            tool_name: self.tool_name,
            arguments: self.arguments,
            result,
            timestamp: self.timestamp,
            execution_time: Some(elapsed.as_secs_f64()),
        }
    }
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a record timestamp. Offset-less forms are read as UTC; the returned
/// value keeps the wall clock the timestamp was written in.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, TimestampParseError> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp);
    }

    let utc = FixedOffset::east_opt(0).ok_or_else(|| TimestampParseError(raw.to_string()))?;
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(utc.from_utc_datetime(&naive));
        }
    }
    if let Some(naive) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(utc.from_utc_datetime(&naive));
    }

    Err(TimestampParseError(raw.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub created_at: String,
    pub updated_at: String,
    pub version: String,
}

impl StoreMetadata {
    pub fn new() -> Self {
        let now = now_timestamp();
        Self {
            created_at: now.clone(),
            updated_at: now,
            version: LOG_FORMAT_VERSION.to_string(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_timestamp();
    }
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk shape of the log file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogDocument {
    pub tool_calls: Vec<ToolCallRecord>,
    pub metadata: StoreMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallQuery {
    pub tool_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Keeps the first N matches in insertion order, not the latest N.
    pub limit: Option<usize>,
}

impl ToolCallQuery {
    pub fn tool(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::default()
        }
    }

    pub fn has_time_bounds(&self) -> bool {
        self.start_time.is_some() || self.end_time.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_calls: u64,
    pub tool_counts: BTreeMap<String, u64>,
    /// Mean seconds per tool over timed records only.
    pub execution_times: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolUsageStats {
    pub count: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub total_execution_time: f64,
    pub avg_execution_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Minute,
    #[default]
    Hour,
    Day,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Bucket label format. Each sorts lexically in chronological order.
    pub fn label_format(self) -> &'static str {
        match self {
            Self::Minute => "%Y-%m-%d %H:%M",
            Self::Hour => "%Y-%m-%d %H:00",
            Self::Day => "%Y-%m-%d",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = UnknownInterval;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(UnknownInterval(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub label: String,
    pub data: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
}

impl TimeSeries {
    pub fn total(&self) -> u64 {
        self.datasets
            .iter()
            .flat_map(|dataset| dataset.data.iter())
            .sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessRateStats {
    pub labels: Vec<String>,
    pub success: Vec<u64>,
    pub failure: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub time_series: TimeSeries,
    pub execution_times: LatencyStats,
    pub success_rates: SuccessRateStats,
    pub metadata: StoreMetadata,
    pub total_calls: u64,
}
