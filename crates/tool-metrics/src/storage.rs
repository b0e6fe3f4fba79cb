use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{MetricsError, MetricsResult};
use crate::types::{
    parse_timestamp, LogDocument, StoreMetadata, StoreStats, ToolCallQuery, ToolCallRecord,
    ToolUsageStats,
};

/// Where the serialized log lives.
///
/// `read` returns `Ok(None)` when nothing has been persisted yet. `write` must
/// be durable when it returns.
pub trait LogBackend: Send + Sync {
    fn location(&self) -> &Path;
    fn read(&self) -> io::Result<Option<Vec<u8>>>;
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Single JSON file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LogBackend for JsonFileBackend {
    fn location(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.path.with_extension("tmp");
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(temp, &self.path)
    }
}

struct StoreState {
    document: LogDocument,
    max_entries: Option<usize>,
}

/// Append-only log of tool call records.
///
/// One mutex covers the in-memory log and its persisted copy, so ids are
/// unique and strictly increasing and readers never observe a torn update.
pub struct DataStore {
    backend: Box<dyn LogBackend>,
    state: Mutex<StoreState>,
}

impl DataStore {
    /// Opens the log. Missing, unreadable or corrupt data yields an empty log.
    pub fn open(backend: impl LogBackend + 'static, max_entries: Option<usize>) -> Self {
        let document = load_document(&backend);
        Self {
            backend: Box::new(backend),
            state: Mutex::new(StoreState {
                document,
                max_entries,
            }),
        }
    }

    pub fn open_file(path: impl Into<PathBuf>, max_entries: Option<usize>) -> Self {
        Self::open(JsonFileBackend::new(path), max_entries)
    }

    pub fn location(&self) -> &Path {
        self.backend.location()
    }

    /// Appends a record and persists the log before returning the assigned id.
    ///
    /// On a write failure the in-memory log is left exactly as it was.
    pub fn append(&self, mut record: ToolCallRecord) -> MetricsResult<u64> {
        let mut state = self.state.lock();
        let max_entries = state.max_entries;
        let document = &mut state.document;

        let id = next_id(&document.tool_calls);
        record.id = id;
        let previous_updated_at = document.metadata.updated_at.clone();

        document.tool_calls.push(record);
        let evicted = enforce_retention(&mut document.tool_calls, max_entries);
        document.metadata.touch();

        if let Err(error) = self.persist(document) {
            document.tool_calls.pop();
            document.tool_calls.splice(0..0, evicted);
            document.metadata.updated_at = previous_updated_at;
            log::error!("tool call {} was not recorded: {}", id, error);
            return Err(error);
        }

        if !evicted.is_empty() {
            log::debug!(
                "evicted {} oldest tool call record(s) to respect max_entries",
                evicted.len()
            );
        }
        Ok(id)
    }

    /// Matching records in insertion order. `limit` keeps the first N matches.
    pub fn query(&self, query: &ToolCallQuery) -> Vec<ToolCallRecord> {
        let state = self.state.lock();
        let matches = state
            .document
            .tool_calls
            .iter()
            .filter(|record| matches_query(record, query))
            .cloned();

        match query.limit {
            Some(limit) => matches.take(limit).collect(),
            None => matches.collect(),
        }
    }

    pub fn all(&self) -> Vec<ToolCallRecord> {
        self.query(&ToolCallQuery::default())
    }

    /// Empties the log. `created_at` is preserved.
    pub fn clear(&self) -> MetricsResult<()> {
        let mut state = self.state.lock();
        let document = &mut state.document;

        let previous = std::mem::take(&mut document.tool_calls);
        let previous_updated_at = document.metadata.updated_at.clone();
        document.metadata.touch();

        if let Err(error) = self.persist(document) {
            document.tool_calls = previous;
            document.metadata.updated_at = previous_updated_at;
            return Err(error);
        }

        log::info!(
            "cleared {} tool call record(s) from {}",
            previous.len(),
            self.location().display()
        );
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        compute_stats(&state.document.tool_calls)
    }

    pub fn tool_usage_stats(&self) -> BTreeMap<String, ToolUsageStats> {
        let state = self.state.lock();
        compute_tool_usage(&state.document.tool_calls)
    }

    /// Consistent copy of the whole log, taken under the store lock.
    pub fn snapshot(&self) -> LogDocument {
        self.state.lock().document.clone()
    }

    pub fn metadata(&self) -> StoreMetadata {
        self.state.lock().document.metadata.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().document.tool_calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.state.lock().max_entries
    }

    /// Takes effect on the next append.
    pub fn set_max_entries(&self, max_entries: Option<usize>) {
        self.state.lock().max_entries = max_entries;
    }

    /// Re-reads the persisted log, picking up writes from other processes.
    pub fn reload(&self) {
        let document = load_document(self.backend.as_ref());
        self.state.lock().document = document;
    }

    fn persist(&self, document: &LogDocument) -> MetricsResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        self.backend
            .write(&bytes)
            .map_err(|source| MetricsError::Persistence {
                path: self.backend.location().to_path_buf(),
                source,
            })
    }
}

fn load_document(backend: &(impl LogBackend + ?Sized)) -> LogDocument {
    let location = backend.location().display().to_string();
    let bytes = match backend.read() {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            log::info!("no tool call log at {}, starting empty", location);
            return LogDocument::default();
        }
        Err(error) => {
            log::warn!("unable to read tool call log {}: {}; starting empty", location, error);
            return LogDocument::default();
        }
    };

    let document = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => decode_document(value, &location),
        Err(error) => {
            log::warn!("tool call log {} is corrupt ({}); starting empty", location, error);
            LogDocument::default()
        }
    };

    log::info!(
        "loaded {} tool call record(s) from {}",
        document.tool_calls.len(),
        location
    );
    document
}

/// Decodes record by record so one damaged entry does not cost the rest.
fn decode_document(value: Value, location: &str) -> LogDocument {
    let (records, metadata) = match value {
        Value::Object(mut object) => {
            let records = object.remove("tool_calls").unwrap_or(Value::Null);
            let metadata = object
                .remove("metadata")
                .and_then(|metadata| serde_json::from_value::<StoreMetadata>(metadata).ok());
            (records, metadata)
        }
        // Bare record arrays, as written by older trackers.
        records @ Value::Array(_) => (records, None),
        _ => {
            log::warn!("tool call log {} has an unexpected shape; starting empty", location);
            return LogDocument::default();
        }
    };

    let tool_calls = match records {
        Value::Array(records) => records
            .into_iter()
            .enumerate()
            .filter_map(|(index, record)| {
                match serde_json::from_value::<ToolCallRecord>(record) {
                    Ok(record) => Some(record),
                    Err(error) => {
                        log::warn!(
                            "skipping malformed tool call #{} in {}: {}",
                            index,
                            location,
                            error
                        );
                        None
                    }
                }
            })
            .collect(),
        _ => Vec::new(),
    };

    LogDocument {
        tool_calls,
        metadata: metadata.unwrap_or_default(),
    }
}

fn next_id(records: &[ToolCallRecord]) -> u64 {
    records.iter().map(|record| record.id).max().unwrap_or(0) + 1
}

fn enforce_retention(
    records: &mut Vec<ToolCallRecord>,
    max_entries: Option<usize>,
) -> Vec<ToolCallRecord> {
    // Never evict the record being appended.
    let limit = match max_entries {
        Some(limit) => limit.max(1),
        None => return Vec::new(),
    };
    if records.len() <= limit {
        return Vec::new();
    }
    let excess = records.len() - limit;
    records.drain(..excess).collect()
}

fn matches_query(record: &ToolCallRecord, query: &ToolCallQuery) -> bool {
    if let Some(tool_name) = &query.tool_name {
        if &record.tool_name != tool_name {
            return false;
        }
    }
    if !query.has_time_bounds() {
        return true;
    }

    let Ok(timestamp) = parse_timestamp(&record.timestamp) else {
        return false;
    };
    let timestamp = timestamp.with_timezone(&Utc);
    query.start_time.map_or(true, |start| timestamp >= start)
        && query.end_time.map_or(true, |end| timestamp <= end)
}

fn compute_stats(records: &[ToolCallRecord]) -> StoreStats {
    let mut tool_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut timings: BTreeMap<String, (f64, u64)> = BTreeMap::new();

    for record in records {
        *tool_counts.entry(record.tool_name.clone()).or_insert(0) += 1;
        if let Some(seconds) = record.execution_time {
            let entry = timings.entry(record.tool_name.clone()).or_insert((0.0, 0));
            entry.0 += seconds;
            entry.1 += 1;
        }
    }

    StoreStats {
        total_calls: records.len() as u64,
        tool_counts,
        execution_times: timings
            .into_iter()
            .map(|(tool, (total, samples))| (tool, total / samples as f64))
            .collect(),
    }
}

fn compute_tool_usage(records: &[ToolCallRecord]) -> BTreeMap<String, ToolUsageStats> {
    let mut usage: BTreeMap<String, (ToolUsageStats, u64)> = BTreeMap::new();

    for record in records {
        let (stats, timed) = usage.entry(record.tool_name.clone()).or_default();
        stats.count += 1;
        if record.result.is_failure() {
            stats.failures += 1;
        }
        if let Some(seconds) = record.execution_time {
            stats.total_execution_time += seconds;
            *timed += 1;
        }
    }

    usage
        .into_iter()
        .map(|(tool, (mut stats, timed))| {
            stats.success_rate = (stats.count - stats.failures) as f64 / stats.count as f64;
            stats.avg_execution_time =
                (timed > 0).then(|| stats.total_execution_time / timed as f64);
            (tool, stats)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::types::{ToolArguments, ToolOutcome};

    fn record(tool: &str, seconds: Option<f64>) -> ToolCallRecord {
        ToolCallRecord::new(tool, ToolArguments::new(), ToolOutcome::success(json!("ok")))
            .with_execution_time(seconds)
    }

    fn record_at(tool: &str, timestamp: &str) -> ToolCallRecord {
        record(tool, Some(0.1)).with_timestamp(timestamp)
    }

    struct FailingBackend {
        path: PathBuf,
    }

    impl LogBackend for FailingBackend {
        fn location(&self) -> &Path {
            &self.path
        }

        fn read(&self) -> io::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn write(&self, _bytes: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only volume"))
        }
    }

    #[test]
    fn append_assigns_sequential_ids_in_insertion_order() {
        let dir = tempdir().expect("temp dir");
        let store = DataStore::open_file(dir.path().join("calls.json"), None);

        for index in 0..5 {
            let id = store
                .append(record(&format!("tool-{}", index), Some(0.01)))
                .expect("append");
            assert_eq!(id, index + 1);
        }

        let records = store.all();
        assert_eq!(records.len(), 5);
        let ids: Vec<u64> = records.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(records[0].tool_name, "tool-0");
        assert_eq!(store.stats().total_calls, records.len() as u64);
    }

    #[test]
    fn records_survive_reopening_the_store() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("calls.json");

        let created_at = {
            let store = DataStore::open_file(&path, None);
            store.append(record("search", Some(0.2))).expect("append");
            store.append(record("calc", None)).expect("append");
            store.metadata().created_at
        };

        let reopened = DataStore::open_file(&path, None);
        let records = reopened.all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].tool_name, "calc");
        assert_eq!(reopened.metadata().created_at, created_at);
        assert_eq!(reopened.append(record("calc", None)).expect("append"), 3);
    }

    #[test]
    fn corrupt_log_opens_empty() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("calls.json");
        fs::write(&path, b"{ not json").expect("write corrupt file");

        let store = DataStore::open_file(&path, None);
        assert!(store.is_empty());
        assert_eq!(store.append(record("search", None)).expect("append"), 1);
    }

    #[test]
    fn malformed_records_are_skipped_on_load() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("calls.json");
        let log = json!({
            "tool_calls": [
                { "id": 1, "tool_name": "search", "arguments": {}, "result": 1,
                  "timestamp": "2024-01-01T10:00:00", "execution_time": 0.1 },
                { "id": 2, "arguments": {} },
                { "id": 3, "tool_name": "calc", "arguments": {}, "result": null,
                  "timestamp": "2024-01-01T11:00:00", "execution_time": null }
            ],
            "metadata": { "created_at": "2024-01-01T09:00:00", "updated_at": "2024-01-01T11:00:00", "version": "1.0.0" }
        });
        fs::write(&path, serde_json::to_vec(&log).expect("serialize")).expect("write");

        let store = DataStore::open_file(&path, None);
        let records = store.all();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].tool_name, "calc");
        assert_eq!(store.metadata().created_at, "2024-01-01T09:00:00");
        assert_eq!(store.append(record("calc", None)).expect("append"), 4);
    }

    #[test]
    fn legacy_record_array_is_accepted() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("calls.json");
        let log = json!([
            { "tool_name": "web_search", "arguments": { "arg0": "news" }, "result": ["r"],
              "timestamp": "2024-01-01T10:00:00", "execution_time": 0.2 }
        ]);
        fs::write(&path, serde_json::to_vec(&log).expect("serialize")).expect("write");

        let store = DataStore::open_file(&path, None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.all()[0].arguments["arg0"], json!("news"));
    }

    #[test]
    fn failed_write_propagates_and_leaves_log_untouched() {
        let store = DataStore::open(
            FailingBackend {
                path: PathBuf::from("/readonly/calls.json"),
            },
            None,
        );
        let before = store.metadata();

        let error = store.append(record("search", None)).expect_err("write must fail");
        assert!(matches!(error, MetricsError::Persistence { .. }));
        assert!(store.is_empty());
        assert_eq!(store.metadata(), before);
    }

    #[test]
    fn query_filters_by_tool_and_time_and_limits_first_matches() {
        let dir = tempdir().expect("temp dir");
        let store = DataStore::open_file(dir.path().join("calls.json"), None);
        store.append(record_at("search", "2024-01-01T09:00:00")).expect("append");
        store.append(record_at("calc", "2024-01-01T10:00:00")).expect("append");
        store.append(record_at("search", "2024-01-01T11:00:00")).expect("append");
        store.append(record_at("search", "2024-01-01T12:00:00")).expect("append");
        store.append(record_at("search", "not a time")).expect("append");

        let search = store.query(&ToolCallQuery::tool("search"));
        assert_eq!(search.len(), 4);

        let bounded = store.query(&ToolCallQuery {
            tool_name: Some("search".to_string()),
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).single(),
            end_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single(),
            limit: None,
        });
        let ids: Vec<u64> = bounded.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![3, 4]);

        let limited = store.query(&ToolCallQuery {
            tool_name: Some("search".to_string()),
            limit: Some(2),
            ..ToolCallQuery::default()
        });
        let ids: Vec<u64> = limited.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn clear_empties_log_but_keeps_created_at() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("calls.json");
        let store = DataStore::open_file(&path, None);
        store.append(record("search", Some(0.1))).expect("append");
        let created_at = store.metadata().created_at;

        store.clear().expect("clear");

        assert!(store.all().is_empty());
        assert_eq!(store.stats().total_calls, 0);
        assert_eq!(store.metadata().created_at, created_at);
        assert!(DataStore::open_file(&path, None).is_empty());
    }

    #[test]
    fn stats_average_only_timed_samples() {
        let dir = tempdir().expect("temp dir");
        let store = DataStore::open_file(dir.path().join("calls.json"), None);
        store.append(record("search", Some(0.1))).expect("append");
        store.append(record("search", Some(0.2))).expect("append");
        store.append(record("search", None)).expect("append");
        store.append(record("calc", Some(0.05))).expect("append");
        store.append(record("untimed", None)).expect("append");

        let stats = store.stats();
        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.tool_counts["search"], 3);
        assert!((stats.execution_times["search"] - 0.15).abs() < 1e-9);
        assert!((stats.execution_times["calc"] - 0.05).abs() < 1e-9);
        assert!(!stats.execution_times.contains_key("untimed"));

        let usage = store.tool_usage_stats();
        let search = &usage["search"];
        assert_eq!(search.count, 3);
        assert!((search.avg_execution_time.expect("timed") - 0.15).abs() < 1e-9);
        assert_eq!(usage["untimed"].avg_execution_time, None);
        assert_eq!(usage["calc"].success_rate, 1.0);
    }

    #[test]
    fn usage_stats_count_failures() {
        let dir = tempdir().expect("temp dir");
        let store = DataStore::open_file(dir.path().join("calls.json"), None);
        store.append(record("calc", Some(0.1))).expect("append");
        store
            .append(ToolCallRecord::new(
                "calc",
                ToolArguments::new(),
                ToolOutcome::failure("DivideByZero", "division by zero"),
            ))
            .expect("append");
        store
            .append(ToolCallRecord::new("calc", ToolArguments::new(), ToolOutcome::success(json!(null))))
            .expect("append");

        let usage = store.tool_usage_stats();
        assert_eq!(usage["calc"].failures, 1);
        assert!((usage["calc"].success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn retention_evicts_oldest_and_keeps_ids_increasing() {
        let dir = tempdir().expect("temp dir");
        let store = DataStore::open_file(dir.path().join("calls.json"), Some(3));

        for index in 0..5 {
            store
                .append(record(&format!("tool-{}", index), None))
                .expect("append");
        }

        let records = store.all();
        let ids: Vec<u64> = records.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(records[0].tool_name, "tool-2");
    }

    #[test]
    fn concurrent_appends_get_unique_ids() {
        let dir = tempdir().expect("temp dir");
        let store = Arc::new(DataStore::open_file(dir.path().join("calls.json"), None));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store
                            .append(record(&format!("worker-{}", worker), None))
                            .expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let ids: Vec<u64> = store.all().iter().map(|record| record.id).collect();
        assert_eq!(ids, (1..=40).collect::<Vec<u64>>());
    }

    #[test]
    fn reload_picks_up_external_writes() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("calls.json");
        let reader = DataStore::open_file(&path, None);
        let writer = DataStore::open_file(&path, None);

        writer.append(record("search", None)).expect("append");
        assert!(reader.is_empty());

        reader.reload();
        assert_eq!(reader.len(), 1);
    }
}
