//! Bounded in-memory buffer of closed spans.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kb_core::{ComponentHealth, SharedClock, SystemClock, TelemetryConfig};
use serde_json::{json, Value};

use crate::span::{SpanHandle, SpanRecord, SpanStatus, ERROR_EVENT};

pub(crate) struct RecorderInner {
    buffer: Mutex<VecDeque<SpanRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    service_name: String,
    pub(crate) clock: SharedClock,
}

impl RecorderInner {
    fn buffer(&self) -> MutexGuard<'_, VecDeque<SpanRecord>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record(&self, record: SpanRecord) {
        tracing::debug!(
            span_id = %record.id,
            name = %record.name,
            status = ?record.status,
            duration_ms = u64::try_from(record.duration().as_millis()).unwrap_or(u64::MAX),
            events = record.events.len(),
            "Span closed"
        );

        let mut buffer = self.buffer();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(record);
    }
}

/// Collects closed spans in a fixed-size ring buffer.
///
/// When the buffer is full the oldest span is dropped to make room. Cloning is
/// cheap; clones share the buffer.
#[derive(Clone)]
pub struct SpanRecorder {
    inner: Arc<RecorderInner>,
}

impl SpanRecorder {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: &TelemetryConfig, clock: SharedClock) -> Self {
        let capacity = config.buffer_capacity.max(1);
        Self {
            inner: Arc::new(RecorderInner {
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                dropped: AtomicU64::new(0),
                service_name: config.service_name.clone(),
                clock,
            }),
        }
    }

    /// Open a root span.
    pub fn start_span(&self, name: impl Into<String>) -> SpanHandle {
        SpanHandle::open(Arc::clone(&self.inner), name.into(), None)
    }

    /// Await `operation` inside a span named `name`.
    ///
    /// The span ends `Ok` or `Error` according to the result; an error's
    /// message is recorded as an `error` event.
    pub async fn in_span<T, E, Fut>(&self, name: impl Into<String>, operation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut span = self.start_span(name);
        let result = operation.await;
        match &result {
            Ok(_) => span.end(SpanStatus::Ok),
            Err(err) => {
                span.add_event(ERROR_EVENT, [("message", err.to_string())]);
                span.end(SpanStatus::Error);
            }
        }
        result
    }

    /// Closed spans, oldest first.
    pub fn snapshot(&self) -> Vec<SpanRecord> {
        self.inner.buffer().iter().cloned().collect()
    }

    /// Remove and return every closed span, oldest first.
    pub fn drain(&self) -> Vec<SpanRecord> {
        self.inner.buffer().drain(..).collect()
    }

    /// Snapshot as a JSON document: `{ service, dropped, spans: [...] }`.
    pub fn export_json(&self) -> serde_json::Result<Value> {
        let spans = serde_json::to_value(self.snapshot())?;
        Ok(json!({
            "service": self.inner.service_name,
            "dropped": self.dropped_count(),
            "spans": spans,
        }))
    }

    pub fn len(&self) -> usize {
        self.inner.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Spans evicted because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Empty the buffer and reset the dropped counter.
    pub fn clear(&self) {
        self.inner.buffer().clear();
        self.inner.dropped.store(0, Ordering::Relaxed);
    }

    pub fn health(&self, component: &str) -> ComponentHealth {
        let dropped = self.dropped_count();
        let health = if dropped > 0 {
            ComponentHealth::degraded(component, "span buffer is dropping spans")
        } else {
            ComponentHealth::healthy(component)
        };
        health
            .with_detail("buffered", self.len() as u64)
            .with_detail("capacity", self.capacity() as u64)
            .with_detail("dropped", dropped)
    }
}

impl fmt::Debug for SpanRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanRecorder")
            .field("service_name", &self.inner.service_name)
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::DROPPED_EVENT;
    use kb_core::{FetchError, HealthStatus, ManualClock};
    use std::time::Duration;

    fn recorder(capacity: usize) -> (SpanRecorder, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = TelemetryConfig::default().with_buffer_capacity(capacity);
        (SpanRecorder::with_clock(&config, clock.shared()), clock)
    }

    #[test]
    fn test_end_records_span() {
        let (recorder, clock) = recorder(10);
        let mut span = recorder.start_span("fetch_company");
        span.set_attribute("company_id", 1);
        span.add_event("cache.miss", [("key", "company:1")]);
        clock.advance(Duration::from_millis(40));
        span.end(SpanStatus::Ok);

        let spans = recorder.snapshot();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "fetch_company");
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.duration(), Duration::from_millis(40));
        assert_eq!(span.attributes["company_id"], 1);
        assert_eq!(span.events[0].attributes["key"], "company:1");
    }

    #[test]
    fn test_span_across_clock_limit_is_recorded() {
        let (recorder, clock) = recorder(10);
        let span = recorder.start_span("long_export");
        clock.advance(Duration::MAX);
        span.end(SpanStatus::Ok);

        let spans = recorder.snapshot();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].duration() > Duration::from_secs(365 * 24 * 3600));
    }

    #[test]
    fn test_events_keep_insertion_order() {
        let (recorder, _clock) = recorder(10);
        let mut span = recorder.start_span("load");
        for name in ["a", "b", "c"] {
            span.mark(name);
        }
        span.end(SpanStatus::Ok);

        let names: Vec<_> = recorder.snapshot()[0]
            .events
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_full_buffer_drops_oldest() {
        let (recorder, _clock) = recorder(2);
        for name in ["first", "second", "third"] {
            recorder.start_span(name).end(SpanStatus::Ok);
        }

        let names: Vec<_> = recorder.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["second", "third"]);
        assert_eq!(recorder.dropped_count(), 1);
        assert_eq!(recorder.health("spans").status, HealthStatus::Degraded);
    }

    #[test]
    fn test_dropped_handle_is_recorded_as_error() {
        let (recorder, _clock) = recorder(10);
        drop(recorder.start_span("abandoned"));

        let spans = recorder.snapshot();
        assert_eq!(spans[0].status, SpanStatus::Error);
        assert!(spans[0].has_event(DROPPED_EVENT));
    }

    #[test]
    fn test_child_links_parent() {
        let (recorder, _clock) = recorder(10);
        let parent = recorder.start_span("request");
        let child = parent.child("db_query");
        let parent_id = parent.id();
        child.end(SpanStatus::Ok);
        parent.end(SpanStatus::Ok);

        let spans = recorder.snapshot();
        assert_eq!(spans[0].name, "db_query");
        assert_eq!(spans[0].parent_id, Some(parent_id));
        assert_eq!(spans[1].parent_id, None);
    }

    #[test]
    fn test_drain_and_clear() {
        let (recorder, _clock) = recorder(1);
        recorder.start_span("a").end(SpanStatus::Ok);
        recorder.start_span("b").end(SpanStatus::Ok);

        assert_eq!(recorder.drain().len(), 1);
        assert!(recorder.is_empty());
        assert_eq!(recorder.dropped_count(), 1);

        recorder.clear();
        assert_eq!(recorder.dropped_count(), 0);
        assert_eq!(recorder.health("spans").status, HealthStatus::Healthy);
    }

    #[test]
    fn test_export_json_shape() {
        let (recorder, _clock) = recorder(4);
        recorder.start_span("a").end(SpanStatus::Error);

        let json = recorder.export_json().unwrap();
        assert_eq!(json["service"], "kb-runtime");
        assert_eq!(json["dropped"], 0);
        assert_eq!(json["spans"][0]["name"], "a");
        assert_eq!(json["spans"][0]["status"], "error");
    }

    #[tokio::test]
    async fn test_in_span_records_outcome() {
        let (recorder, _clock) = recorder(4);

        let ok: Result<u32, FetchError> = recorder.in_span("ok", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, FetchError> = recorder
            .in_span("fail", async { Err(FetchError::upstream("company:1", "timeout")) })
            .await;
        assert!(err.is_err());

        let spans = recorder.snapshot();
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[1].status, SpanStatus::Error);
        let event = &spans[1].events[0];
        assert_eq!(event.name, ERROR_EVENT);
        assert!(event.attributes["message"]
            .as_str()
            .unwrap()
            .contains("timeout"));
    }
}
