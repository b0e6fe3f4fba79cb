use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::args::ToolArgs;
use crate::error::MetricsResult;
use crate::storage::DataStore;
use crate::types::{PendingToolCall, ToolOutcome};

const PANIC_ERROR_TYPE: &str = "panic";

/// Per-tool tracking switches. Tools without an entry are tracked.
///
/// Clones share the same flags, so the config facade and every interceptor
/// see updates immediately.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    flags: Arc<DashMap<String, bool>>,
}

impl ToolFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flags(flags: &BTreeMap<String, bool>) -> Self {
        let filter = Self::new();
        filter.replace(flags);
        filter
    }

    pub fn set(&self, tool_name: impl Into<String>, enabled: bool) {
        self.flags.insert(tool_name.into(), enabled);
    }

    pub fn is_enabled(&self, tool_name: &str) -> bool {
        self.flags.get(tool_name).map_or(true, |enabled| *enabled)
    }

    pub fn replace(&self, flags: &BTreeMap<String, bool>) {
        self.flags.clear();
        for (tool_name, enabled) in flags {
            self.flags.insert(tool_name.clone(), *enabled);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.flags
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// What a measured call produced: the tool's own output, and whether the
/// record made it into the store (`Ok(None)` when tracking is disabled).
#[derive(Debug)]
pub struct Measured<T, E> {
    pub output: Result<T, E>,
    pub recorded: MetricsResult<Option<u64>>,
}

/// Measures tool invocations and appends one record per call.
///
/// The caller always gets the tool's own result back: errors are returned
/// unchanged and panics are resumed once the failure has been recorded.
#[derive(Clone)]
pub struct Interceptor {
    store: Arc<DataStore>,
    filter: ToolFilter,
}

impl Interceptor {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self::with_filter(store, ToolFilter::new())
    }

    pub fn with_filter(store: Arc<DataStore>, filter: ToolFilter) -> Self {
        Self { store, filter }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn filter(&self) -> &ToolFilter {
        &self.filter
    }

    /// Returns a callable with the same signature as `tool` that records every
    /// invocation under `name`.
    pub fn wrap<A, T, E, F>(&self, name: impl Into<String>, tool: F) -> impl Fn(A) -> Result<T, E>
    where
        A: ToolArgs,
        T: Serialize,
        E: Display,
        F: Fn(A) -> Result<T, E>,
    {
        let interceptor = self.clone();
        let name = name.into();
        move |args: A| interceptor.call(&name, args, &tool)
    }

    /// Measures a single invocation. Persistence failures are logged; use
    /// [`Interceptor::measure`] to observe them.
    pub fn call<A, T, E, F>(&self, name: &str, args: A, tool: F) -> Result<T, E>
    where
        A: ToolArgs,
        T: Serialize,
        E: Display,
        F: FnOnce(A) -> Result<T, E>,
    {
        let measured = self.measure(name, args, tool);
        if let Err(error) = &measured.recorded {
            log::error!("failed to record call to tool '{}': {}", name, error);
        }
        measured.output
    }

    pub fn measure<A, T, E, F>(&self, name: &str, args: A, tool: F) -> Measured<T, E>
    where
        A: ToolArgs,
        T: Serialize,
        E: Display,
        F: FnOnce(A) -> Result<T, E>,
    {
        if !self.filter.is_enabled(name) {
            return Measured {
                output: tool(args),
                recorded: Ok(None),
            };
        }

        let pending = PendingToolCall::open(name, args.to_arguments());
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| tool(args)));
        let elapsed = started.elapsed();

        self.settle(pending, result, elapsed)
    }

    /// Async counterpart of [`Interceptor::call`]; the measured duration spans
    /// the whole future.
    pub async fn call_async<A, T, E, F, Fut>(&self, name: &str, args: A, tool: F) -> Result<T, E>
    where
        A: ToolArgs,
        T: Serialize,
        E: Display,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let measured = self.measure_async(name, args, tool).await;
        if let Err(error) = &measured.recorded {
            log::error!("failed to record call to tool '{}': {}", name, error);
        }
        measured.output
    }

    pub async fn measure_async<A, T, E, F, Fut>(&self, name: &str, args: A, tool: F) -> Measured<T, E>
    where
        A: ToolArgs,
        T: Serialize,
        E: Display,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.filter.is_enabled(name) {
            return Measured {
                output: tool(args).await,
                recorded: Ok(None),
            };
        }

        let pending = PendingToolCall::open(name, args.to_arguments());
        let started = Instant::now();
        let result = AssertUnwindSafe(async move { tool(args).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        self.settle(pending, result, elapsed)
    }

    fn settle<T, E>(
        &self,
        pending: PendingToolCall,
        result: Result<Result<T, E>, Box<dyn Any + Send>>,
        elapsed: Duration,
    ) -> Measured<T, E>
    where
        T: Serialize,
        E: Display,
    {
        let output = match result {
            Ok(output) => output,
            Err(payload) => {
                let tool_name = pending.tool_name().to_string();
                let outcome = ToolOutcome::failure(PANIC_ERROR_TYPE, panic_message(payload.as_ref()));
                if let Err(error) = self.store.append(pending.finish(outcome, elapsed)) {
                    log::error!("failed to record panicking call to '{}': {}", tool_name, error);
                }
                panic::resume_unwind(payload);
            }
        };

        let outcome = match &output {
            Ok(value) => ToolOutcome::Success(result_value(pending.tool_name(), value)),
            Err(error) => ToolOutcome::failure(std::any::type_name::<E>(), error.to_string()),
        };
        let recorded = self.store.append(pending.finish(outcome, elapsed)).map(Some);

        Measured { output, recorded }
    }
}

fn result_value<T: Serialize>(tool_name: &str, value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(value) => value,
        Err(error) => {
            log::warn!(
                "result of tool '{}' is not JSON-serializable, recording null: {}",
                tool_name,
                error
            );
            Value::Null
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::args::Named;
    use crate::error::MetricsError;
    use crate::storage::LogBackend;

    fn interceptor() -> (Interceptor, TempDir) {
        let dir = tempdir().expect("temp dir");
        let store = Arc::new(DataStore::open_file(dir.path().join("calls.json"), None));
        (Interceptor::new(store), dir)
    }

    #[test]
    fn wrapped_tool_returns_value_and_records_call() {
        let (interceptor, _dir) = interceptor();
        let add = interceptor.wrap("calculator", |(a, b): (i64, i64)| Ok::<_, String>(a + b));

        assert_eq!(add((2, 3)), Ok(5));

        let records = interceptor.store().all();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, 1);
        assert_eq!(record.tool_name, "calculator");
        assert_eq!(record.arguments["arg0"], json!(2));
        assert_eq!(record.arguments["arg1"], json!(3));
        assert_eq!(record.result, ToolOutcome::Success(json!(5)));
        assert!(record.execution_time.expect("timed") >= 0.0);
    }

    #[test]
    fn none_result_is_recorded_as_success() {
        let (interceptor, _dir) = interceptor();
        let lookup = interceptor.wrap("lookup", |_: (u32,)| Ok::<Option<u32>, String>(None));

        assert_eq!(lookup((404,)), Ok(None));
        let record = &interceptor.store().all()[0];
        assert_eq!(record.result, ToolOutcome::Success(Value::Null));
    }

    #[test]
    fn error_is_recorded_and_returned_unchanged() {
        let (interceptor, _dir) = interceptor();
        let divide = interceptor.wrap("divide", |(a, b): (i32, i32)| {
            if b == 0 {
                Err(io::Error::new(io::ErrorKind::InvalidInput, "division by zero"))
            } else {
                Ok(a / b)
            }
        });

        let error = divide((1, 0)).expect_err("division by zero");
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);

        let record = &interceptor.store().all()[0];
        match &record.result {
            ToolOutcome::Failure {
                error_type,
                message,
            } => {
                assert!(error_type.contains("io"));
                assert_eq!(message, "division by zero");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(record.execution_time.is_some());
    }

    #[test]
    fn panic_is_recorded_then_resumed() {
        let (interceptor, _dir) = interceptor();
        let explode = interceptor.wrap("explode", |_: ()| -> Result<(), String> {
            panic!("tool blew up")
        });

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| explode(())));
        assert!(outcome.is_err());

        let records = interceptor.store().all();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].result,
            ToolOutcome::failure("panic", "tool blew up")
        );
    }

    #[test]
    fn disabled_tool_passes_through_without_recording() {
        let (interceptor, _dir) = interceptor();
        interceptor.filter().set("calculator", false);
        let calls = AtomicU32::new(0);
        let add = interceptor.wrap("calculator", |(a, b): (i64, i64)| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(a + b)
        });

        assert_eq!(add((1, 1)), Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(interceptor.store().is_empty());

        interceptor.filter().set("calculator", true);
        assert_eq!(add((1, 2)), Ok(3));
        assert_eq!(interceptor.store().len(), 1);
    }

    #[test]
    fn named_arguments_are_recorded_by_name() {
        #[derive(Serialize)]
        struct Search {
            query: &'static str,
        }

        let (interceptor, _dir) = interceptor();
        let result = interceptor.call("web_search", Named(Search { query: "weather" }), |args| {
            Ok::<_, String>(vec![format!("Result for {}", args.0.query)])
        });

        assert_eq!(result, Ok(vec!["Result for weather".to_string()]));
        let record = &interceptor.store().all()[0];
        assert_eq!(record.arguments["query"], json!("weather"));
    }

    struct ReadOnlyBackend(PathBuf);

    impl LogBackend for ReadOnlyBackend {
        fn location(&self) -> &Path {
            &self.0
        }

        fn read(&self) -> io::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn write(&self, _bytes: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn measure_surfaces_persistence_failures_with_the_output() {
        let store = Arc::new(DataStore::open(ReadOnlyBackend(PathBuf::from("calls.json")), None));
        let interceptor = Interceptor::new(store);

        let measured = interceptor.measure("echo", ("hi",), |(text,)| Ok::<_, String>(text));

        assert_eq!(measured.output, Ok("hi"));
        assert!(matches!(
            measured.recorded,
            Err(MetricsError::Persistence { .. })
        ));
        assert_eq!(interceptor.call("echo", ("again",), |(text,)| Ok::<_, String>(text)), Ok("again"));
    }

    #[tokio::test]
    async fn async_tools_are_measured() {
        let (interceptor, _dir) = interceptor();

        let result = interceptor
            .call_async("fetch", ("https://example.com",), |(url,)| async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                Ok::<_, String>(url.len())
            })
            .await;
        assert_eq!(result, Ok(19));

        let failed = interceptor
            .call_async("fetch", ("bad",), |_| async { Err::<usize, _>("timeout".to_string()) })
            .await;
        assert_eq!(failed, Err("timeout".to_string()));

        let records = interceptor.store().all();
        assert_eq!(records.len(), 2);
        assert!(records[0].execution_time.expect("timed") >= 0.02);
        assert!(records[1].result.is_failure());
    }
}
