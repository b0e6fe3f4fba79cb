use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::ExportError;
use crate::storage::DataStore;
use crate::types::{
    parse_timestamp, DashboardSnapshot, Dataset, ExportFormat, Interval, LatencyStats, LogDocument,
    SuccessRateStats, TimeSeries, ToolCallRecord,
};

pub const CSV_HEADER: &str = "timestamp,tool_name,execution_time,success";

/// Read-only analytic views. Each view works on one consistent snapshot of
/// the store and is recomputed on every call.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<DataStore>,
}

impl Aggregator {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self { store }
    }

    pub fn time_series(&self, interval: Interval, tool_filter: Option<&[String]>) -> TimeSeries {
        time_series(&self.store.snapshot().tool_calls, interval, tool_filter)
    }

    pub fn latency_breakdown(&self) -> LatencyStats {
        latency_breakdown(&self.store.snapshot().tool_calls)
    }

    pub fn success_rate_breakdown(&self) -> SuccessRateStats {
        success_rate_breakdown(&self.store.snapshot().tool_calls)
    }

    pub fn export_to_columnar(&self, format: ExportFormat) -> Result<String, ExportError> {
        export_document(&self.store.snapshot(), format)
    }

    pub fn dashboard_snapshot(&self) -> DashboardSnapshot {
        self.dashboard(Interval::Hour, None)
    }

    /// Dashboard with a custom time-series interval and tool filter. The
    /// filter only applies to the time series.
    pub fn dashboard(&self, interval: Interval, tool_filter: Option<&[String]>) -> DashboardSnapshot {
        let document = self.store.snapshot();
        let records = &document.tool_calls;
        DashboardSnapshot {
            time_series: time_series(records, interval, tool_filter),
            execution_times: latency_breakdown(records),
            success_rates: success_rate_breakdown(records),
            total_calls: records.len() as u64,
            metadata: document.metadata,
        }
    }
}

/// Bucket label for a record timestamp, in the wall clock it was written in.
pub fn bucket_label(timestamp: &str, interval: Interval) -> Option<String> {
    match parse_timestamp(timestamp) {
        Ok(parsed) => Some(parsed.naive_local().format(interval.label_format()).to_string()),
        Err(error) => {
            log::debug!("skipping record in time series: {}", error);
            None
        }
    }
}

pub fn time_series(
    records: &[ToolCallRecord],
    interval: Interval,
    tool_filter: Option<&[String]>,
) -> TimeSeries {
    // An empty filter selects every tool.
    let tool_filter = tool_filter.filter(|tools| !tools.is_empty());
    let mut buckets: BTreeMap<String, HashMap<&str, u64>> = BTreeMap::new();
    let mut tools: BTreeSet<&str> = BTreeSet::new();

    for record in records {
        if let Some(filter) = tool_filter {
            if !filter.iter().any(|tool| tool == &record.tool_name) {
                continue;
            }
        }
        let Some(label) = bucket_label(&record.timestamp, interval) else {
            continue;
        };

        *buckets
            .entry(label)
            .or_default()
            .entry(record.tool_name.as_str())
            .or_insert(0) += 1;
        tools.insert(record.tool_name.as_str());
    }

    let datasets = tools
        .into_iter()
        .map(|tool| Dataset {
            label: tool.to_string(),
            data: buckets
                .values()
                .map(|counts| counts.get(tool).copied().unwrap_or(0))
                .collect(),
        })
        .collect();

    TimeSeries {
        labels: buckets.into_keys().collect(),
        datasets,
    }
}

pub fn latency_breakdown(records: &[ToolCallRecord]) -> LatencyStats {
    let mut timings: BTreeMap<&str, (f64, u64)> = BTreeMap::new();
    for record in records {
        if let Some(seconds) = record.execution_time {
            let entry = timings.entry(record.tool_name.as_str()).or_insert((0.0, 0));
            entry.0 += seconds;
            entry.1 += 1;
        }
    }

    let mut averages: Vec<(&str, f64)> = timings
        .into_iter()
        .map(|(tool, (total, samples))| (tool, total / samples as f64))
        .collect();
    averages.sort_by(|(tool_a, avg_a), (tool_b, avg_b)| {
        avg_b
            .partial_cmp(avg_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| tool_a.cmp(tool_b))
    });

    LatencyStats {
        labels: averages.iter().map(|(tool, _)| tool.to_string()).collect(),
        values: averages.iter().map(|(_, avg)| *avg).collect(),
    }
}

pub fn success_rate_breakdown(records: &[ToolCallRecord]) -> SuccessRateStats {
    let mut counts: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for record in records {
        let entry = counts.entry(record.tool_name.as_str()).or_insert((0, 0));
        if record.result.is_failure() {
            entry.1 += 1;
        } else {
            entry.0 += 1;
        }
    }

    let mut tools: Vec<(&str, u64, u64)> = counts
        .into_iter()
        .map(|(tool, (success, failure))| (tool, success, failure))
        .collect();
    tools.sort_by(|a, b| {
        success_fraction(b.1, b.2)
            .partial_cmp(&success_fraction(a.1, a.2))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });

    SuccessRateStats {
        labels: tools.iter().map(|(tool, _, _)| tool.to_string()).collect(),
        success: tools.iter().map(|(_, success, _)| *success).collect(),
        failure: tools.iter().map(|(_, _, failure)| *failure).collect(),
    }
}

fn success_fraction(success: u64, failure: u64) -> f64 {
    let total = success + failure;
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64
    }
}

pub fn export_document(document: &LogDocument, format: ExportFormat) -> Result<String, ExportError> {
    match format {
        ExportFormat::Csv => Ok(export_csv(&document.tool_calls)),
        ExportFormat::Json => Ok(serde_json::to_string_pretty(document)?),
    }
}

/// Fields are written unquoted: a comma inside a tool name or timestamp
/// shifts the remaining columns of that row.
pub fn export_csv(records: &[ToolCallRecord]) -> String {
    let mut csv = String::from(CSV_HEADER);
    for record in records {
        let execution_time = record
            .execution_time
            .map(|seconds| seconds.to_string())
            .unwrap_or_default();
        csv.push('\n');
        csv.push_str(&format!(
            "{},{},{},{}",
            record.timestamp,
            record.tool_name,
            execution_time,
            record.is_success()
        ));
    }
    csv
}
