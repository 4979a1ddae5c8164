//! Write-behind buffer.
//!
//! [`WriteBehindBuffer`] accumulates rows in memory per destination table and
//! writes them in bulk on a fixed interval. Each flush cycle swaps the live
//! buffer for an empty one under a lock, so every enqueued row lands in
//! exactly one snapshot, then writes the snapshot's destinations through a
//! [`BatchWriter`].
//!
//! Rows that fail transiently are returned to the live buffer before the
//! cycle's `after_flush` runs, so they are retried by the next cycle.
//!
//! Producers are throttled once a destination holds more than
//! [`BufferConfig::high_water_mark`] rows. Throttled producers re-check on
//! [`BufferConfig::backpressure_poll_interval`] and are also woken whenever a
//! flush swaps the buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Sink, SinkError};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::{Metrics, TableLabels};
use crate::model::Row;
use crate::writer::{BatchWriter, DEFAULT_WRITE_TIMEOUT, WriteReport};

/// Configuration for the write-behind buffer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Interval between flush cycles.
    #[serde(deserialize_with = "crate::config::duration")]
    pub flush_interval: Duration,
    /// Pending rows per destination above which producers are throttled.
    pub high_water_mark: usize,
    /// Interval at which throttled producers re-check the buffer.
    #[serde(deserialize_with = "crate::config::duration")]
    pub backpressure_poll_interval: Duration,
    /// Maximum number of destinations written concurrently during a flush.
    pub flush_concurrency: usize,
    /// Deadline for each bulk insert statement. `None` waits forever.
    #[serde(deserialize_with = "crate::config::optional_duration")]
    pub write_timeout: Option<Duration>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            high_water_mark: 1_000_000,
            backpressure_poll_interval: Duration::from_secs(5),
            flush_concurrency: 4,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
        }
    }
}

/// A destination whose flush dropped rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationFailure {
    pub table: String,
    pub rows: usize,
    pub rejected: usize,
    /// First single-row failure observed for the destination.
    pub error: SinkError,
}

impl DestinationFailure {
    /// True if none of the destination's rows were written.
    pub fn is_total(&self) -> bool {
        self.rejected >= self.rows
    }

    pub fn into_error(self) -> Error {
        Error::RowsRejected {
            table: self.table,
            rejected: self.rejected,
            first: self.error,
        }
    }
}

/// A destination whose rows failed transiently and were returned to the
/// buffer for the next cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Deferral {
    pub table: String,
    pub rows: usize,
    /// First transient failure observed for the destination.
    pub error: SinkError,
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    /// Destinations present in the snapshot.
    pub destinations: usize,
    /// Rows present in the snapshot.
    pub rows: usize,
    /// Rows accepted by the sink.
    pub written: usize,
    /// Rows rejected in isolation and dropped.
    pub rejected: usize,
    /// Rows returned to the buffer after a transient failure.
    pub deferred: usize,
    /// Destinations that dropped rows, in completion order.
    pub failures: Vec<DestinationFailure>,
    /// Destinations with deferred rows, in completion order.
    pub deferrals: Vec<Deferral>,
}

impl FlushSummary {
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// True if the snapshot held rows and none of them were written.
    pub fn is_total_failure(&self) -> bool {
        self.rows > 0 && self.written == 0
    }

    /// True if rows of `table` in this cycle were not written: some were
    /// deferred, or every one was rejected.
    pub fn is_unwritten(&self, table: &str) -> bool {
        self.deferrals.iter().any(|d| d.table == table)
            || self
                .failures
                .iter()
                .any(|f| f.table == table && f.is_total())
    }

    fn record(&mut self, report: &WriteReport) {
        self.written += report.written;
        self.rejected += report.rejected();
        self.deferred += report.deferred_rows();
        if let Some(first) = report.failures.first() {
            self.failures.push(DestinationFailure {
                table: report.table.clone(),
                rows: report.rows,
                rejected: report.rejected(),
                error: first.error.clone(),
            });
        }
        if let Some(error) = &report.deferred_error {
            self.deferrals.push(Deferral {
                table: report.table.clone(),
                rows: report.deferred_rows(),
                error: error.clone(),
            });
        }
    }
}

/// Callbacks around each flush cycle.
///
/// `before_flush` completes before the buffer is swapped; `after_flush` runs
/// once every destination of the snapshot has been attempted.
#[async_trait]
pub trait FlushHooks: Send + Sync {
    async fn before_flush(&self) {}

    async fn after_flush(&self, _summary: &FlushSummary) {}
}

/// Hooks that do nothing.
pub struct NoopHooks;

#[async_trait]
impl FlushHooks for NoopHooks {}

#[derive(Default)]
struct Pending {
    rows: Vec<Row>,
    columns: Vec<String>,
}

struct FlushLoop {
    stop_tok: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: BufferConfig,
    writer: BatchWriter,
    metrics: Arc<Metrics>,
    pending: Mutex<HashMap<String, Pending>>,
    /// Notified after every swap.
    swapped: Notify,
    /// Serializes flush cycles.
    flush_lock: tokio::sync::Mutex<()>,
    flush_loop: Mutex<Option<FlushLoop>>,
}

/// In-memory, per-destination row buffer flushed in bulk on a timer.
///
/// Cloning is cheap; clones share the same buffer.
#[derive(Clone)]
pub struct WriteBehindBuffer {
    inner: Arc<Inner>,
}

impl WriteBehindBuffer {
    pub fn new(sink: Arc<dyn Sink>, config: BufferConfig) -> Self {
        Self::with_metrics(sink, config, Arc::new(Metrics::default()))
    }

    pub fn with_metrics(sink: Arc<dyn Sink>, config: BufferConfig, metrics: Arc<Metrics>) -> Self {
        let writer = BatchWriter::new(sink)
            .with_write_timeout(config.write_timeout)
            .with_metrics(metrics.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                writer,
                metrics,
                pending: Mutex::new(HashMap::new()),
                swapped: Notify::new(),
                flush_lock: tokio::sync::Mutex::new(()),
                flush_loop: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    /// Appends `row` to `table`'s pending rows and records `columns` as the
    /// destination's column list, replacing the previous one.
    ///
    /// Returns immediately unless the destination holds more than the
    /// high-water mark, in which case this waits until a flush drains it.
    pub async fn enqueue(&self, table: &str, row: Row, columns: &[String]) {
        self.append(table, row, columns);
        self.wait_for_capacity(table).await;
    }

    /// Appends `row` without applying backpressure.
    ///
    /// Flush hooks run while the cycle holds the flush lock and must not wait
    /// for a swap, so they enqueue through this.
    pub(crate) fn append(&self, table: &str, row: Row, columns: &[String]) {
        {
            let mut pending = self.inner.pending.lock().expect("lock poisoned");
            let entry = pending.entry(table.to_string()).or_default();
            entry.rows.push(row);
            if entry.columns.as_slice() != columns {
                entry.columns = columns.to_vec();
            }
        }
        self.inner
            .metrics
            .rows_enqueued_total
            .get_or_create(&TableLabels::new(table))
            .inc();
        self.inner.metrics.pending_rows.inc();
    }

    async fn wait_for_capacity(&self, table: &str) {
        let mark = self.inner.config.high_water_mark;
        let mut throttled = false;
        loop {
            // register before checking so a swap between the check and the
            // wait is not missed
            let swapped = self.inner.swapped.notified();
            tokio::pin!(swapped);
            swapped.as_mut().enable();

            let pending = self.pending_rows(table);
            if pending <= mark {
                if throttled {
                    debug!(table, pending, "buffer drained, resuming producer");
                }
                return;
            }
            if !throttled {
                warn!(
                    table,
                    pending,
                    high_water_mark = mark,
                    "buffer above high-water mark, throttling producer"
                );
                throttled = true;
            }
            let _ =
                tokio::time::timeout(self.inner.config.backpressure_poll_interval, swapped).await;
        }
    }

    /// Rows currently buffered for `table`.
    pub fn pending_rows(&self, table: &str) -> usize {
        self.inner
            .pending
            .lock()
            .expect("lock poisoned")
            .get(table)
            .map_or(0, |p| p.rows.len())
    }

    /// Destinations with buffered rows, sorted by name.
    pub fn pending_destinations(&self) -> Vec<String> {
        let pending = self.inner.pending.lock().expect("lock poisoned");
        let mut tables: Vec<String> = pending
            .iter()
            .filter(|(_, p)| !p.rows.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        tables.sort();
        tables
    }

    /// Starts the periodic flush loop.
    ///
    /// Does nothing if a loop is already running; the running loop keeps the
    /// hooks it was started with.
    pub fn start(&self, hooks: Arc<dyn FlushHooks>) {
        let mut flush_loop = self.inner.flush_loop.lock().expect("lock poisoned");
        if flush_loop
            .as_ref()
            .is_some_and(|running| !running.stop_tok.is_cancelled())
        {
            debug!("flush loop already running");
            return;
        }

        let stop_tok = CancellationToken::new();
        let handle = tokio::spawn(Self::run(self.inner.clone(), hooks, stop_tok.clone()));
        info!(
            flush_interval = ?self.inner.config.flush_interval,
            "started flush loop"
        );
        *flush_loop = Some(FlushLoop {
            stop_tok,
            handle: Some(handle),
        });
    }

    /// Signals the flush loop to exit after its current cycle.
    ///
    /// Pending rows are not flushed.
    pub fn stop(&self) {
        if let Some(running) = self.inner.flush_loop.lock().expect("lock poisoned").as_ref() {
            running.stop_tok.cancel();
        }
    }

    /// Waits for a stopped flush loop to exit.
    pub async fn join(&self) -> Result<()> {
        let handle = self
            .inner
            .flush_loop
            .lock()
            .expect("lock poisoned")
            .as_mut()
            .and_then(|running| running.handle.take());
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("flush loop panicked: {}", e))),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .flush_loop
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .is_some_and(|running| !running.stop_tok.is_cancelled())
    }

    /// Runs one flush cycle now.
    pub async fn flush(&self, hooks: &dyn FlushHooks) -> FlushSummary {
        self.inner.flush(hooks).await
    }

    async fn run(inner: Arc<Inner>, hooks: Arc<dyn FlushHooks>, stop_tok: CancellationToken) {
        let period = inner.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    inner.flush(hooks.as_ref()).await;
                }
                _ = stop_tok.cancelled() => {
                    break;
                }
            }
        }
        info!("flush loop stopped");
    }
}

impl Inner {
    async fn flush(&self, hooks: &dyn FlushHooks) -> FlushSummary {
        let _cycle = self.flush_lock.lock().await;
        let started = Instant::now();

        hooks.before_flush().await;

        let snapshot = self.swap();
        self.swapped.notify_waiters();

        let mut summary = FlushSummary {
            destinations: snapshot.len(),
            rows: snapshot.values().map(|p| p.rows.len()).sum(),
            ..Default::default()
        };
        self.metrics.pending_rows.dec_by(summary.rows as i64);

        let writer = &self.writer;
        let outcomes: Vec<(WriteReport, Pending)> = stream::iter(snapshot)
            .map(|(table, pending)| async move {
                let report = writer.write(&table, &pending.rows, &pending.columns).await;
                (report, pending)
            })
            .buffer_unordered(self.config.flush_concurrency.max(1))
            .collect()
            .await;
        for (report, pending) in outcomes {
            summary.record(&report);
            if !report.deferred.is_empty() {
                self.requeue(&report, pending);
            }
        }

        for deferral in &summary.deferrals {
            warn!(
                table = %deferral.table,
                rows = deferral.rows,
                error = %deferral.error,
                "deferred rows to next flush after transient error"
            );
        }
        for failure in &summary.failures {
            error!(
                table = %failure.table,
                rows = failure.rows,
                rejected = failure.rejected,
                error = %failure.error,
                "dropped rows while flushing destination"
            );
        }
        if !summary.is_empty() {
            info!(
                destinations = summary.destinations,
                rows = summary.rows,
                written = summary.written,
                rejected = summary.rejected,
                deferred = summary.deferred,
                "flushed buffer"
            );
        }

        hooks.after_flush(&summary).await;

        self.metrics.flush_cycles_total.inc();
        self.metrics
            .flush_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        summary
    }

    /// Returns the rows of `report`'s deferred ranges to the live buffer.
    ///
    /// The live destination keeps its column list if it has one, since
    /// producers may have enqueued newer rows during the write.
    fn requeue(&self, report: &WriteReport, pending: Pending) {
        let mut deferred = vec![false; pending.rows.len()];
        for range in &report.deferred {
            deferred[range.clone()].fill(true);
        }
        let rows: Vec<Row> = pending
            .rows
            .into_iter()
            .zip(deferred)
            .filter_map(|(row, deferred)| deferred.then_some(row))
            .collect();
        let count = rows.len();
        {
            let mut live = self.pending.lock().expect("lock poisoned");
            let entry = live.entry(report.table.clone()).or_default();
            entry.rows.extend(rows);
            if entry.columns.is_empty() {
                entry.columns = pending.columns;
            }
        }
        self.metrics.pending_rows.inc_by(count as i64);
    }

    fn swap(&self) -> HashMap<String, Pending> {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let mut snapshot = std::mem::take(&mut *pending);
        snapshot.retain(|_, p| !p.rows.is_empty());
        snapshot
    }
}
