//! Span and event types.

use std::sync::Arc;
use std::time::Duration;

use kb_core::{new_entity_id, Clock, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::recorder::RecorderInner;

/// Free-form attributes attached to spans and events.
pub type Attributes = serde_json::Map<String, Value>;

/// Event name recorded when a span handle is dropped without being ended.
pub const DROPPED_EVENT: &str = "span.dropped";

/// Event name recorded by [`SpanRecorder::in_span`](crate::SpanRecorder::in_span)
/// when the wrapped operation fails.
pub const ERROR_EVENT: &str = "error";

/// Outcome of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// Timestamped annotation inside a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
}

/// A closed span as stored in the recorder buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EntityId>,
    pub name: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub status: SpanStatus,
    pub events: Vec<SpanEvent>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: Attributes,
}

impl SpanRecord {
    /// Wall-clock time between start and end. Zero if the clock went
    /// backwards.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|event| event.name == name)
    }
}

/// A span that is still open.
///
/// Close it with [`end`](Self::end). A handle dropped while open is still
/// recorded, with [`SpanStatus::Error`] and a `span.dropped` event.
pub struct SpanHandle {
    recorder: Arc<RecorderInner>,
    id: EntityId,
    parent_id: Option<EntityId>,
    name: String,
    start_time: Timestamp,
    events: Vec<SpanEvent>,
    attributes: Attributes,
    ended: bool,
}

impl SpanHandle {
    pub(crate) fn open(
        recorder: Arc<RecorderInner>,
        name: String,
        parent_id: Option<EntityId>,
    ) -> Self {
        let start_time = recorder.clock.now();
        Self {
            recorder,
            id: new_entity_id(),
            parent_id,
            name,
            start_time,
            events: Vec::new(),
            attributes: Attributes::new(),
            ended: false,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn parent_id(&self) -> Option<EntityId> {
        self.parent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Append a timestamped event.
    pub fn add_event<I, K, V>(&mut self, name: impl Into<String>, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: self.recorder.clock.now(),
            attributes: attributes
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        });
    }

    /// Append an event without attributes.
    pub fn mark(&mut self, name: impl Into<String>) {
        self.add_event(name, std::iter::empty::<(String, Value)>());
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Start a span whose parent is this one.
    pub fn child(&self, name: impl Into<String>) -> SpanHandle {
        SpanHandle::open(Arc::clone(&self.recorder), name.into(), Some(self.id))
    }

    /// Close the span and hand it to the recorder.
    pub fn end(mut self, status: SpanStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: SpanStatus) {
        if self.ended {
            return;
        }
        self.ended = true;
        let record = SpanRecord {
            id: self.id,
            parent_id: self.parent_id,
            name: std::mem::take(&mut self.name),
            start_time: self.start_time,
            end_time: self.recorder.clock.now(),
            status,
            events: std::mem::take(&mut self.events),
            attributes: std::mem::take(&mut self.attributes),
        };
        self.recorder.record(record);
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        if !self.ended {
            tracing::warn!(span_id = %self.id, name = %self.name, "Span dropped without end");
            self.mark(DROPPED_EVENT);
            self.finish(SpanStatus::Error);
        }
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("name", &self.name)
            .field("events", &self.events.len())
            .finish()
    }
}
