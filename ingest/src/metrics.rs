//! Prometheus metrics for the ingestion pipeline.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Labels for per-destination metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TableLabels {
    pub table: String,
}

impl TableLabels {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }
}

/// Container for all Prometheus metrics.
pub struct Metrics {
    registry: Registry,

    /// Counter of rows accepted by the write-behind buffer.
    pub rows_enqueued_total: Family<TableLabels, Counter>,

    /// Counter of rows written to the sink.
    pub rows_written_total: Family<TableLabels, Counter>,

    /// Counter of rows rejected in isolation and dropped.
    pub rows_rejected_total: Family<TableLabels, Counter>,

    /// Counter of rows that failed transiently and were returned to the buffer.
    pub rows_deferred_total: Family<TableLabels, Counter>,

    /// Counter of bulk insert statements submitted, including bisection retries.
    pub write_attempts_total: Counter,

    /// Counter of completed flush cycles.
    pub flush_cycles_total: Counter,

    /// Histogram of flush cycle duration in seconds.
    pub flush_duration_seconds: Histogram,

    /// Gauge of rows currently buffered across all destinations.
    pub pending_rows: Gauge,

    /// Counter of background tasks that completed successfully.
    pub tasks_completed_total: Counter,

    /// Counter of background tasks that returned an error or panicked.
    pub tasks_failed_total: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let rows_enqueued_total = Family::<TableLabels, Counter>::default();
        registry.register(
            "ingest_rows_enqueued",
            "Total number of rows accepted by the write-behind buffer",
            rows_enqueued_total.clone(),
        );

        let rows_written_total = Family::<TableLabels, Counter>::default();
        registry.register(
            "ingest_rows_written",
            "Total number of rows written to the sink",
            rows_written_total.clone(),
        );

        let rows_rejected_total = Family::<TableLabels, Counter>::default();
        registry.register(
            "ingest_rows_rejected",
            "Total number of rows rejected in isolation and dropped",
            rows_rejected_total.clone(),
        );

        let rows_deferred_total = Family::<TableLabels, Counter>::default();
        registry.register(
            "ingest_rows_deferred",
            "Total number of rows deferred to a later flush after a transient failure",
            rows_deferred_total.clone(),
        );

        let write_attempts_total = Counter::default();
        registry.register(
            "ingest_write_attempts",
            "Total number of bulk insert statements submitted",
            write_attempts_total.clone(),
        );

        let flush_cycles_total = Counter::default();
        registry.register(
            "ingest_flush_cycles",
            "Total number of completed flush cycles",
            flush_cycles_total.clone(),
        );

        // Buckets from 10ms to ~80s
        let flush_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "ingest_flush_duration_seconds",
            "Flush cycle duration in seconds",
            flush_duration_seconds.clone(),
        );

        let pending_rows = Gauge::default();
        registry.register(
            "ingest_pending_rows",
            "Number of rows currently buffered",
            pending_rows.clone(),
        );

        let tasks_completed_total = Counter::default();
        registry.register(
            "ingest_tasks_completed",
            "Total number of background tasks completed",
            tasks_completed_total.clone(),
        );

        let tasks_failed_total = Counter::default();
        registry.register(
            "ingest_tasks_failed",
            "Total number of background tasks that failed",
            tasks_failed_total.clone(),
        );

        Self {
            registry,
            rows_enqueued_total,
            rows_written_total,
            rows_rejected_total,
            rows_deferred_total,
            write_attempts_total,
            flush_cycles_total,
            flush_duration_seconds,
            pending_rows,
            tasks_completed_total,
            tasks_failed_total,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_create_default_metrics() {
        // given/when
        let metrics = Metrics::new();

        // then
        let encoded = metrics.encode();
        assert!(encoded.contains("# HELP ingest_rows_enqueued"));
        assert!(encoded.contains("# HELP ingest_rows_written"));
        assert!(encoded.contains("# HELP ingest_rows_rejected"));
        assert!(encoded.contains("# HELP ingest_rows_deferred"));
        assert!(encoded.contains("# HELP ingest_write_attempts"));
        assert!(encoded.contains("# HELP ingest_flush_cycles"));
        assert!(encoded.contains("# HELP ingest_flush_duration_seconds"));
        assert!(encoded.contains("# HELP ingest_pending_rows"));
        assert!(encoded.contains("# HELP ingest_tasks_completed"));
    }

    #[test]
    fn should_encode_table_label() {
        // given
        let metrics = Metrics::new();

        // when
        metrics
            .rows_written_total
            .get_or_create(&TableLabels::new("transactions"))
            .inc_by(3);

        // then
        assert!(metrics.encode().contains("table=\"transactions\""));
    }
}
