use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Sink for per-import invocation metrics.
///
/// `key` is the import name (`__invoke_function_and_return_string`, ...); `kind` is
/// [`BridgeError::kind`](crate::BridgeError::kind).
pub trait BridgeMetricsSink: Send + Sync {
    fn record_invocation(&self, key: &str, duration: Duration);
    fn record_error(&self, key: &str, kind: &'static str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl BridgeMetricsSink for NoopMetricsSink {
    fn record_invocation(&self, _key: &str, _duration: Duration) {}

    fn record_error(&self, _key: &str, _kind: &'static str) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestMetricsSnapshot {
    pub invocation_count: u64,
    pub error_count: u64,
    pub error_kinds: Vec<&'static str>,
    pub durations: Vec<Duration>,
}

/// In-memory sink for asserting on metrics in tests.
#[derive(Debug, Default)]
pub struct TestMetricsSink {
    inner: Mutex<HashMap<String, TestMetricsSnapshot>>,
}

impl TestMetricsSink {
    /// Returns a point-in-time snapshot of all recorded metrics.
    pub fn snapshot(&self) -> HashMap<String, TestMetricsSnapshot> {
        self.inner.lock().clone()
    }

    /// Returns a snapshot for `key`, or an empty one if `key` was never recorded.
    pub fn snapshot_for(&self, key: &str) -> TestMetricsSnapshot {
        self.inner.lock().get(key).cloned().unwrap_or_default()
    }
}

impl BridgeMetricsSink for TestMetricsSink {
    fn record_invocation(&self, key: &str, duration: Duration) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(key.to_owned()).or_default();
        entry.invocation_count = entry.invocation_count.saturating_add(1);
        entry.durations.push(duration);
    }

    fn record_error(&self, key: &str, kind: &'static str) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(key.to_owned()).or_default();
        entry.error_count = entry.error_count.saturating_add(1);
        entry.error_kinds.push(kind);
    }
}
