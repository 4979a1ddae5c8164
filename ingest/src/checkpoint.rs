//! Durable stream checkpoints.
//!
//! The [`CheckpointCoordinator`] tracks, per stream, the latest position the
//! producer has handed to the buffer and the latest position known to be
//! flushed. It plugs into the buffer as [`FlushHooks`]:
//!
//! - `before_flush` captures each stream's current position as pending. Every
//!   row enqueued up to that position is in the snapshot about to be written.
//! - `after_flush` enqueues a checkpoint row for each pending position and
//!   marks it confirmed.
//!
//! Checkpoint rows travel through the same buffer as data rows, so they are
//! persisted one cycle after the data they cover.
//!
//! A pending position is held, not confirmed, while rows it covers are
//! unwritten. A stream is held when one of its tracked destinations had rows
//! deferred or entirely rejected in the cycle. A stream with no tracked
//! destinations is held whenever any destination deferred rows or the whole
//! cycle failed. Deferred rows are back in the buffer before `after_flush`
//! runs, so the next cycle's snapshot holds them together with every row up
//! to the position it captures.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::sink::quote_literal;
use common::{Clock, QueryRow, Sink, SystemClock};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::buffer::{FlushHooks, FlushSummary, WriteBehindBuffer};
use crate::error::Result;
use crate::model::{Position, Value};

/// Configuration for checkpoint persistence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Table holding `(stream_name, cursor, timestamp)` rows.
    pub table: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            table: "ingest_checkpoints".to_string(),
        }
    }
}

/// Observable checkpoint state of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointState {
    /// Nothing has been confirmed and nothing is in flight.
    NoCheckpoint,
    /// A position was captured by a flush that has not completed yet.
    Pending(Position),
    /// The position was confirmed flushed and its checkpoint row enqueued.
    Confirmed(Position),
}

#[derive(Debug, Default)]
struct StreamState {
    current: Position,
    pending: Option<Position>,
    confirmed: Option<Position>,
    /// Tables the stream's rows are written to.
    destinations: BTreeSet<String>,
}

impl StreamState {
    fn is_held(&self, summary: &FlushSummary) -> bool {
        if self.destinations.is_empty() {
            summary.is_total_failure() || !summary.deferrals.is_empty()
        } else {
            self.destinations
                .iter()
                .any(|table| summary.is_unwritten(table))
        }
    }
}

/// Coordinates per-stream positions with buffer flushes.
pub struct CheckpointCoordinator {
    sink: Arc<dyn Sink>,
    buffer: WriteBehindBuffer,
    table: String,
    columns: Vec<String>,
    clock: Arc<dyn Clock>,
    streams: Mutex<HashMap<String, StreamState>>,
    provisioned: OnceCell<()>,
}

impl CheckpointCoordinator {
    pub fn new(sink: Arc<dyn Sink>, buffer: WriteBehindBuffer, config: CheckpointConfig) -> Self {
        Self {
            sink,
            buffer,
            table: config.table,
            columns: vec![
                "stream_name".to_string(),
                "cursor".to_string(),
                "timestamp".to_string(),
            ],
            clock: Arc::new(SystemClock),
            streams: Mutex::new(HashMap::new()),
            provisioned: OnceCell::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Records `table` as a destination of `stream`'s rows, so the stream's
    /// checkpoint is held only by failures in its own destinations.
    pub fn track(&self, stream: &str, table: &str) {
        let mut streams = self.streams.lock().expect("lock poisoned");
        streams
            .entry(stream.to_string())
            .or_default()
            .destinations
            .insert(table.to_string());
    }

    /// Records `position` as the stream's latest position handed to the buffer.
    pub fn advance(&self, stream: &str, position: Position) {
        let mut streams = self.streams.lock().expect("lock poisoned");
        streams.entry(stream.to_string()).or_default().current = position;
    }

    /// Reads the stream's latest persisted position.
    ///
    /// A missing checkpoint table is a cold start: the table is created and
    /// the initial position returned. A stream without checkpoint rows also
    /// starts from the initial position.
    pub async fn get_checkpoint(&self, stream: &str) -> Result<Position> {
        if !self.table_exists().await? {
            info!(
                stream,
                table = %self.table,
                "no checkpoint table, starting from initial position"
            );
            self.ensure_table().await?;
            return Ok(Position::initial());
        }

        let query = format!(
            "SELECT cursor FROM {} WHERE stream_name = {} ORDER BY timestamp DESC LIMIT 1",
            self.table,
            quote_literal(stream)
        );
        let rows = self.sink.query(&query).await?;
        let position = rows
            .first()
            .and_then(|row| row.get("cursor"))
            .and_then(|cursor| cursor.as_str())
            .map(Position::new)
            .unwrap_or_default();
        debug!(stream, cursor = %position, "read checkpoint");
        Ok(position)
    }

    /// Loads the stream's checkpoint and seeds its state with it.
    pub async fn resume(&self, stream: &str) -> Result<Position> {
        let position = self.get_checkpoint(stream).await?;
        let mut streams = self.streams.lock().expect("lock poisoned");
        let state = streams.entry(stream.to_string()).or_default();
        state.current = position.clone();
        state.pending = None;
        state.confirmed = (!position.is_initial()).then(|| position.clone());
        Ok(position)
    }

    pub fn state(&self, stream: &str) -> CheckpointState {
        let streams = self.streams.lock().expect("lock poisoned");
        match streams.get(stream) {
            Some(StreamState {
                pending: Some(p), ..
            }) => CheckpointState::Pending(p.clone()),
            Some(StreamState {
                confirmed: Some(c),
                ..
            }) => CheckpointState::Confirmed(c.clone()),
            _ => CheckpointState::NoCheckpoint,
        }
    }

    /// Latest position confirmed flushed, if any.
    pub fn confirmed(&self, stream: &str) -> Option<Position> {
        let streams = self.streams.lock().expect("lock poisoned");
        streams.get(stream).and_then(|s| s.confirmed.clone())
    }

    /// Latest position handed to the buffer.
    pub fn current(&self, stream: &str) -> Position {
        let streams = self.streams.lock().expect("lock poisoned");
        streams
            .get(stream)
            .map(|s| s.current.clone())
            .unwrap_or_default()
    }

    async fn table_exists(&self) -> Result<bool> {
        let query = format!(
            "SELECT count(*) AS count FROM system.tables \
             WHERE database = currentDatabase() AND name = {}",
            quote_literal(&self.table)
        );
        let rows = self.sink.query(&query).await?;
        Ok(rows.first().map(row_count).unwrap_or(0) > 0)
    }

    /// Creates the checkpoint table once per process.
    pub async fn ensure_table(&self) -> Result<()> {
        self.provisioned
            .get_or_try_init(|| async {
                let ddl = format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     stream_name String, \
                     cursor String, \
                     timestamp DateTime DEFAULT now()\
                     ) ENGINE = ReplacingMergeTree() ORDER BY (stream_name)",
                    self.table
                );
                self.sink.exec(&ddl).await
            })
            .await?;
        Ok(())
    }

    fn checkpoint_row(&self, stream: &str, position: &Position) -> Vec<Value> {
        vec![
            Value::from(stream),
            Value::from(position.as_str()),
            Value::UInt(self.clock.unix_seconds()),
        ]
    }
}

/// Reads a `count` column, which ClickHouse quotes as a string for 64-bit
/// integers in JSON output.
fn row_count(row: &QueryRow) -> u64 {
    match row.get("count") {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl FlushHooks for CheckpointCoordinator {
    async fn before_flush(&self) {
        let mut streams = self.streams.lock().expect("lock poisoned");
        for state in streams.values_mut() {
            let unconfirmed = state.confirmed.as_ref() != Some(&state.current);
            if !state.current.is_initial() && unconfirmed {
                state.pending = Some(state.current.clone());
            }
        }
    }

    async fn after_flush(&self, summary: &FlushSummary) {
        let confirmed: Vec<(String, Position)> = {
            let mut streams = self.streams.lock().expect("lock poisoned");
            streams
                .iter_mut()
                .filter_map(|(stream, state)| {
                    let pending = state.pending.as_ref()?;
                    if state.is_held(summary) {
                        warn!(
                            stream = %stream,
                            cursor = %pending,
                            rows = summary.rows,
                            rejected = summary.rejected,
                            deferred = summary.deferred,
                            "covered rows not written, holding checkpoint"
                        );
                        return None;
                    }
                    let position = state.pending.take()?;
                    state.confirmed = Some(position.clone());
                    Some((stream.clone(), position))
                })
                .collect()
        };
        if confirmed.is_empty() {
            return;
        }

        if let Err(e) = self.ensure_table().await {
            error!(table = %self.table, error = %e, "error provisioning checkpoint table");
        }
        for (stream, position) in confirmed {
            info!(
                stream = %stream,
                cursor = %position,
                destinations = summary.destinations,
                rows = summary.rows,
                "flushed rows, checkpointing"
            );
            let row = self.checkpoint_row(&stream, &position);
            self.buffer.append(&self.table, row, &self.columns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, Deferral};
    use common::MockClock;
    use common::sink::SinkError;
    use common::sink::in_memory::InMemorySink;

    fn count_row(count: &str) -> QueryRow {
        let mut row = QueryRow::new();
        row.insert("count".into(), count.into());
        row
    }

    fn coordinator(sink: Arc<InMemorySink>) -> (CheckpointCoordinator, WriteBehindBuffer) {
        let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
        let coordinator = CheckpointCoordinator::new(sink, buffer.clone(), CheckpointConfig::default())
            .with_clock(Arc::new(MockClock::at_unix_seconds(1_700_000_000)));
        (coordinator, buffer)
    }

    #[tokio::test]
    async fn should_cold_start_when_table_missing() {
        // given
        let sink = Arc::new(InMemorySink::new().with_responder(|_| Ok(vec![count_row("0")])));
        let (coordinator, _) = coordinator(sink.clone());

        // when
        let position = coordinator.get_checkpoint("s").await.unwrap();

        // then
        assert!(position.is_initial());
        let statements = sink.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS ingest_checkpoints"));
    }

    #[tokio::test]
    async fn should_read_latest_cursor() {
        // given
        let sink = Arc::new(InMemorySink::new().with_responder(|q| {
            if q.contains("system.tables") {
                return Ok(vec![count_row("1")]);
            }
            let mut row = QueryRow::new();
            row.insert("cursor".into(), "c-42".into());
            Ok(vec![row])
        }));
        let (coordinator, _) = coordinator(sink.clone());

        // when
        let position = coordinator.resume("s").await.unwrap();

        // then
        assert_eq!(position, Position::from("c-42"));
        assert_eq!(
            coordinator.state("s"),
            CheckpointState::Confirmed(Position::from("c-42"))
        );
        let queries = sink.queries();
        assert!(queries[1].contains("WHERE stream_name = 's' ORDER BY timestamp DESC LIMIT 1"));
    }

    #[tokio::test]
    async fn should_start_from_initial_position_when_stream_has_no_rows() {
        // given
        let sink = Arc::new(InMemorySink::new().with_responder(|q| {
            if q.contains("system.tables") {
                Ok(vec![count_row("1")])
            } else {
                Ok(vec![])
            }
        }));
        let (coordinator, _) = coordinator(sink);

        // when
        let position = coordinator.resume("s").await.unwrap();

        // then
        assert!(position.is_initial());
        assert_eq!(coordinator.state("s"), CheckpointState::NoCheckpoint);
    }

    #[tokio::test]
    async fn should_confirm_pending_position_after_flush() {
        // given
        let sink = Arc::new(InMemorySink::new());
        let (coordinator, buffer) = coordinator(sink.clone());
        coordinator.advance("s", Position::from("p1"));

        // when
        coordinator.before_flush().await;
        let pending = coordinator.state("s");
        coordinator.after_flush(&FlushSummary::default()).await;

        // then
        assert_eq!(pending, CheckpointState::Pending(Position::from("p1")));
        assert_eq!(coordinator.confirmed("s"), Some(Position::from("p1")));
        assert_eq!(buffer.pending_rows("ingest_checkpoints"), 1);
    }

    #[tokio::test]
    async fn should_not_checkpoint_unchanged_position() {
        // given
        let sink = Arc::new(InMemorySink::new());
        let (coordinator, buffer) = coordinator(sink);
        coordinator.advance("s", Position::from("p1"));
        coordinator.before_flush().await;
        coordinator.after_flush(&FlushSummary::default()).await;

        // when
        coordinator.before_flush().await;
        coordinator.after_flush(&FlushSummary::default()).await;

        // then
        assert_eq!(buffer.pending_rows("ingest_checkpoints"), 1);
    }

    #[tokio::test]
    async fn should_hold_checkpoint_when_every_row_failed() {
        // given
        let sink = Arc::new(InMemorySink::new());
        let (coordinator, buffer) = coordinator(sink);
        coordinator.advance("s", Position::from("p1"));
        let outage = FlushSummary {
            destinations: 1,
            rows: 3,
            rejected: 3,
            ..Default::default()
        };

        // when
        coordinator.before_flush().await;
        coordinator.after_flush(&outage).await;

        // then
        assert_eq!(
            coordinator.state("s"),
            CheckpointState::Pending(Position::from("p1"))
        );
        assert_eq!(buffer.pending_rows("ingest_checkpoints"), 0);
    }

    #[tokio::test]
    async fn should_hold_only_streams_whose_destinations_failed() {
        // given
        let sink = Arc::new(InMemorySink::new());
        let (coordinator, _) = coordinator(sink);
        coordinator.track("s1", "t1");
        coordinator.track("s2", "t2");
        coordinator.advance("s1", Position::from("x1"));
        coordinator.advance("s2", Position::from("y1"));
        let summary = FlushSummary {
            destinations: 2,
            rows: 2,
            written: 1,
            deferred: 1,
            deferrals: vec![Deferral {
                table: "t1".to_string(),
                rows: 1,
                error: SinkError::Connection("refused".to_string()),
            }],
            ..Default::default()
        };

        // when
        coordinator.before_flush().await;
        coordinator.after_flush(&summary).await;

        // then
        assert_eq!(
            coordinator.state("s1"),
            CheckpointState::Pending(Position::from("x1"))
        );
        assert_eq!(coordinator.confirmed("s2"), Some(Position::from("y1")));
    }

    #[tokio::test]
    async fn should_hold_untracked_stream_on_any_deferral() {
        // given
        let sink = Arc::new(InMemorySink::new());
        let (coordinator, _) = coordinator(sink);
        coordinator.advance("s", Position::from("p1"));
        let summary = FlushSummary {
            destinations: 2,
            rows: 2,
            written: 1,
            deferred: 1,
            deferrals: vec![Deferral {
                table: "other".to_string(),
                rows: 1,
                error: SinkError::Timeout(std::time::Duration::from_secs(60)),
            }],
            ..Default::default()
        };

        // when
        coordinator.before_flush().await;
        coordinator.after_flush(&summary).await;

        // then
        assert_eq!(coordinator.confirmed("s"), None);
    }

    #[tokio::test]
    async fn should_write_checkpoint_row_with_clock_timestamp() {
        // given
        let sink = Arc::new(InMemorySink::new());
        let (coordinator, buffer) = coordinator(sink.clone());
        coordinator.advance("s", Position::from("p1"));
        buffer.flush(&coordinator).await;

        // when
        buffer.flush(&coordinator).await;

        // then
        let inserts = sink.inserts_into("ingest_checkpoints");
        assert_eq!(inserts.len(), 1);
        assert!(inserts[0].contains("(stream_name, cursor, timestamp)"));
        assert!(inserts[0].ends_with("VALUES ('s','p1',1700000000)"));
    }

    #[test]
    fn should_parse_count_from_string_or_number() {
        assert_eq!(row_count(&count_row("3")), 3);
        let mut numeric = QueryRow::new();
        numeric.insert("count".into(), 2.into());
        assert_eq!(row_count(&numeric), 2);
        assert_eq!(row_count(&QueryRow::new()), 0);
    }
}
