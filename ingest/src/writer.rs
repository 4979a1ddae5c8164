//! Adaptive bulk writer.
//!
//! [`BatchWriter`] submits a destination's rows as one `INSERT` statement.
//! When the sink rejects the statement the batch is split at its midpoint and
//! each half is written independently, recursively, until the failing rows
//! are isolated. A row that still fails on its own is dropped and reported.
//!
//! Transient failures are not the rows' fault. An unreachable sink defers the
//! whole failing range without splitting it, and a single row that fails
//! transiently is deferred instead of dropped. Deferred rows are handed back
//! to the caller to be written again later.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use common::{Sink, SinkError, SinkResult};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::{Metrics, TableLabels};
use crate::model::Row;

/// Default deadline for a single bulk insert statement.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

const RESERVED_KEYWORDS: &[&str] = &[
    "INDEX", "ENGINE", "TABLE", "DATABASE", "ORDER", "BY", "PRIMARY", "KEY", "UNIQUE",
    "PARTITION", "TTL", "SETTINGS", "FORMAT", "ALIAS", "SAMPLE", "AS", "WHERE", "HAVING", "IN",
    "LIMIT", "UNION", "ALL", "SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "ALTER", "DROP",
    "RENAME", "OPTIMIZE",
];

/// A row that was rejected in isolation.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFailure {
    /// Index of the row within the batch passed to [`BatchWriter::write`].
    pub index: usize,
    pub error: SinkError,
}

/// Outcome of writing one destination's batch.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub table: String,
    /// Rows in the batch.
    pub rows: usize,
    /// Rows accepted by the sink.
    pub written: usize,
    /// Statements submitted, including the initial one.
    pub attempts: usize,
    /// Rows rejected in isolation, in the order they were observed.
    pub failures: Vec<RowFailure>,
    /// Index ranges that failed transiently and were not written.
    pub deferred: Vec<Range<usize>>,
    /// First transient error observed, if any range was deferred.
    pub deferred_error: Option<SinkError>,
}

impl WriteReport {
    /// True if every row was written.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.deferred.is_empty()
    }

    pub fn rejected(&self) -> usize {
        self.failures.len()
    }

    /// Rows that failed transiently and must be written again.
    pub fn deferred_rows(&self) -> usize {
        self.deferred.iter().map(|r| r.len()).sum()
    }

    fn defer(&mut self, range: Range<usize>, error: SinkError) {
        self.deferred.push(range);
        self.deferred_error.get_or_insert(error);
    }

    /// Statements submitted after the initial one failed.
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }

    /// Converts the report into the number of rows written, or an error
    /// carrying the first observed single-row failure. Deferred rows are an
    /// error too, carrying the transient failure.
    pub fn into_result(self) -> Result<usize> {
        if let Some(first) = self.failures.first() {
            return Err(Error::RowsRejected {
                table: self.table.clone(),
                rejected: self.failures.len(),
                first: first.error.clone(),
            });
        }
        match self.deferred_error {
            None => Ok(self.written),
            Some(error) => Err(Error::Sink(error)),
        }
    }
}

/// Writes batches to a [`Sink`], bisecting on failure.
#[derive(Clone)]
pub struct BatchWriter {
    sink: Arc<dyn Sink>,
    write_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Sets the deadline for each submitted statement. `None` waits forever.
    pub fn with_write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    /// Writes `rows` to `table`.
    ///
    /// The whole batch is submitted first. A rejected range longer than one
    /// row is split at its midpoint and both halves are written, left first.
    /// A single rejected row is not retried; it is recorded in the report's
    /// failures and dropped from this write.
    ///
    /// A range that fails because the sink is unreachable is deferred as a
    /// whole, as is a single row that fails with any other transient error.
    pub async fn write(&self, table: &str, rows: &[Row], columns: &[String]) -> WriteReport {
        let mut report = WriteReport {
            table: table.to_string(),
            rows: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return report;
        }

        let mut ranges: Vec<Range<usize>> = vec![0..rows.len()];
        while let Some(range) = ranges.pop() {
            report.attempts += 1;
            self.metrics.write_attempts_total.inc();
            match self.submit(table, &rows[range.clone()], columns).await {
                Ok(()) => report.written += range.len(),
                Err(e @ SinkError::Connection(_)) => {
                    debug!(
                        table,
                        rows = range.len(),
                        error = %e,
                        "sink unreachable, deferring batch"
                    );
                    report.defer(range, e);
                }
                Err(e) if range.len() > 1 => {
                    let mid = range.start + range.len() / 2;
                    debug!(
                        table,
                        rows = range.len(),
                        error = %e,
                        "error inserting batch, retrying with smaller batches"
                    );
                    ranges.push(mid..range.end);
                    ranges.push(range.start..mid);
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        table,
                        index = range.start,
                        error = %e,
                        "transient error inserting single row, deferring it"
                    );
                    report.defer(range, e);
                }
                Err(e) => {
                    warn!(
                        table,
                        index = range.start,
                        row = %render_row(&rows[range.start]),
                        error = %e,
                        "error inserting single row, dropping it"
                    );
                    report.failures.push(RowFailure {
                        index: range.start,
                        error: e,
                    });
                }
            }
        }

        let labels = TableLabels::new(table);
        self.metrics
            .rows_written_total
            .get_or_create(&labels)
            .inc_by(report.written as u64);
        if !report.failures.is_empty() {
            self.metrics
                .rows_rejected_total
                .get_or_create(&labels)
                .inc_by(report.failures.len() as u64);
        }
        if !report.deferred.is_empty() {
            self.metrics
                .rows_deferred_total
                .get_or_create(&labels)
                .inc_by(report.deferred_rows() as u64);
        }
        report
    }

    async fn submit(&self, table: &str, rows: &[Row], columns: &[String]) -> SinkResult<()> {
        let sql = insert_statement(table, rows, columns);
        match self.write_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.sink.exec(&sql))
                .await
                .map_err(|_| SinkError::Timeout(deadline))?,
            None => self.sink.exec(&sql).await,
        }
    }
}

/// Builds the bulk insert statement for `rows`.
///
/// Inserts are acknowledged only after ClickHouse's asynchronous insert
/// buffer has persisted them.
pub fn insert_statement(table: &str, rows: &[Row], columns: &[String]) -> String {
    let mut sql = format!("INSERT INTO {} ", table);
    if !columns.is_empty() {
        let cols: Vec<Cow<'_, str>> = columns.iter().map(|c| escape_column(c)).collect();
        sql.push('(');
        sql.push_str(&cols.join(", "));
        sql.push_str(") ");
    }
    sql.push_str("SETTINGS async_insert=1, wait_for_async_insert=1 VALUES ");
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&render_row(row));
    }
    sql
}

fn render_row(row: &Row) -> String {
    let values: Vec<String> = row.iter().map(|v| v.to_sql()).collect();
    format!("({})", values.join(","))
}

/// Back-quotes column names that collide with reserved keywords.
pub fn escape_column(name: &str) -> Cow<'_, str> {
    let upper = name.to_ascii_uppercase();
    if RESERVED_KEYWORDS.contains(&upper.as_str()) {
        Cow::Owned(format!("`{}`", name))
    } else {
        Cow::Borrowed(name)
    }
}
