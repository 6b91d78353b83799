//! KB Telemetry - in-process span recording
//!
//! [`SpanRecorder`] keeps the most recent closed spans in a bounded ring
//! buffer for inspection and JSON export. Spans are single-process
//! bookkeeping; nothing is shipped to a collector.
//!
//! [`init_tracing`] installs the `tracing` subscriber used for log output.

mod recorder;
mod span;
mod subscriber;

pub use recorder::SpanRecorder;
pub use span::{
    Attributes, SpanEvent, SpanHandle, SpanRecord, SpanStatus, DROPPED_EVENT, ERROR_EVENT,
};
pub use subscriber::{build_filter, init_tracing};
