//! Metrics Sinks
//!
//! Store metrics are plain counts labelled with the model and the store type:
//!
//! - `kvstore_read_total` - items we tried to read
//! - `kvstore_hit_total` - items found and read
//! - `kvstore_write_total` - items written
//! - `kvstore_delete_total` - items deleted
//! - `kvstore_size` - items held, for stores that can estimate it
//!
//! There is no default for the size: if the size is unknown it is not 0.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::error::Result;

const LABELS: [&str; 2] = ["model", "store"];

/// Metric emitted by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMetric {
    Read,
    Hit,
    Write,
    Delete,
    Size,
}

impl StoreMetric {
    /// Counters initialized to zero when a store is decorated
    pub const COUNTERS: [StoreMetric; 4] = [
        StoreMetric::Read,
        StoreMetric::Hit,
        StoreMetric::Write,
        StoreMetric::Delete,
    ];

    /// Exposition name
    pub fn metric_name(&self) -> &'static str {
        match self {
            StoreMetric::Read => "kvstore_read_total",
            StoreMetric::Hit => "kvstore_hit_total",
            StoreMetric::Write => "kvstore_write_total",
            StoreMetric::Delete => "kvstore_delete_total",
            StoreMetric::Size => "kvstore_size",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            StoreMetric::Read => "Number of items we tried to read from the store",
            StoreMetric::Hit => "Number of items found and read from the store",
            StoreMetric::Write => "Number of items written to the store",
            StoreMetric::Delete => "Number of items deleted from the store",
            StoreMetric::Size => "Number of items stored in the store",
        }
    }
}

impl fmt::Display for StoreMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_name())
    }
}

/// One metric observation
#[derive(Debug, Clone, Copy)]
pub struct Datum<'a> {
    pub metric: StoreMetric,
    pub model: &'a str,
    pub store: &'a str,
    pub value: i64,
}

/// Destination of store metrics
pub trait MetricsSink: Send + Sync {
    /// Register zero-valued counters for a newly decorated store
    fn init(&self, _model: &str, _store: &str) -> Result<()> {
        Ok(())
    }

    /// Record one observation; counters add, the size replaces
    fn record(&self, datum: &Datum<'_>) -> Result<()>;
}

/// Sink dropping everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _datum: &Datum<'_>) -> Result<()> {
        Ok(())
    }
}

/// Prometheus-backed sink
pub struct PrometheusSink {
    registry: Registry,
    read: IntCounterVec,
    hit: IntCounterVec,
    write: IntCounterVec,
    delete: IntCounterVec,
    size: IntGaugeVec,
}

impl PrometheusSink {
    /// Create a sink with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a sink registering its metrics into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let counter = |metric: StoreMetric| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(metric.metric_name(), metric.help()), &LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let read = counter(StoreMetric::Read)?;
        let hit = counter(StoreMetric::Hit)?;
        let write = counter(StoreMetric::Write)?;
        let delete = counter(StoreMetric::Delete)?;

        let size = IntGaugeVec::new(
            Opts::new(StoreMetric::Size.metric_name(), StoreMetric::Size.help()),
            &LABELS,
        )?;
        registry.register(Box::new(size.clone()))?;

        Ok(Self {
            registry,
            read,
            hit,
            write,
            delete,
            size,
        })
    }

    /// Registry holding this sink's metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of a metric series; reading creates the series if needed
    pub fn value(&self, metric: StoreMetric, model: &str, store: &str) -> Result<i64> {
        let labels = [model, store];
        match self.counter(metric) {
            Some(counter) => Ok(counter.get_metric_with_label_values(&labels)?.get() as i64),
            None => Ok(self.size.get_metric_with_label_values(&labels)?.get()),
        }
    }

    /// Text exposition of all metrics in the registry
    pub fn render(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }

    fn counter(&self, metric: StoreMetric) -> Option<&IntCounterVec> {
        match metric {
            StoreMetric::Read => Some(&self.read),
            StoreMetric::Hit => Some(&self.hit),
            StoreMetric::Write => Some(&self.write),
            StoreMetric::Delete => Some(&self.delete),
            StoreMetric::Size => None,
        }
    }
}

impl fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSink").finish_non_exhaustive()
    }
}

impl MetricsSink for PrometheusSink {
    fn init(&self, model: &str, store: &str) -> Result<()> {
        for metric in StoreMetric::COUNTERS {
            if let Some(counter) = self.counter(metric) {
                counter.get_metric_with_label_values(&[model, store])?;
            }
        }
        Ok(())
    }

    fn record(&self, datum: &Datum<'_>) -> Result<()> {
        let labels = [datum.model, datum.store];

        match self.counter(datum.metric) {
            Some(counter) => counter
                .get_metric_with_label_values(&labels)?
                .inc_by(datum.value.max(0) as u64),
            None => self.size.get_metric_with_label_values(&labels)?.set(datum.value),
        }

        Ok(())
    }
}

static GLOBAL_SINK: Lazy<Arc<dyn MetricsSink>> = Lazy::new(|| {
    match PrometheusSink::with_registry(prometheus::default_registry().clone()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!(error = %e, "can not register store metrics in the default registry");
            Arc::new(NoopSink)
        }
    }
});

/// Process-wide sink backed by the default Prometheus registry
pub fn global_sink() -> Arc<dyn MetricsSink> {
    GLOBAL_SINK.clone()
}

// =============================================================================
// Tests
// =============================================================================
