//! Metrics Integration
//!
//! Sinks receiving the per-store counters and size samples emitted by the
//! metrics decorator.

mod sink;

pub use sink::{global_sink, Datum, MetricsSink, NoopSink, PrometheusSink, StoreMetric};
