//! Structured logging: `tracing` events to stderr, plain or ndjson.

mod format;

pub use format::{RunEvent, StructuredLogger};
