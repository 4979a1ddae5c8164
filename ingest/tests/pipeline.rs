use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::SinkError;
use common::sink::in_memory::InMemorySink;
use ingest::{
    BufferConfig, CheckpointConfig, CheckpointCoordinator, CheckpointState, FlushHooks,
    FlushSummary, NoopHooks, Position, Row, Value, WriteBehindBuffer,
};

fn id_columns() -> Vec<String> {
    vec!["id".to_string()]
}

fn row(id: &str) -> Row {
    vec![Value::from(id)]
}

#[derive(Default)]
struct CountingHooks {
    cycles: AtomicUsize,
}

impl CountingHooks {
    fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlushHooks for CountingHooks {
    async fn after_flush(&self, _summary: &FlushSummary) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn should_write_buffered_rows_in_one_bulk_insert() {
    // given
    let sink = Arc::new(InMemorySink::new());
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    for id in ["A", "B", "C"] {
        buffer.enqueue("T", row(id), &id_columns()).await;
    }

    // when
    let summary = buffer.flush(&NoopHooks).await;

    // then
    assert_eq!(buffer.pending_rows("T"), 0);
    assert_eq!(summary.destinations, 1);
    assert_eq!(summary.written, 3);
    assert_eq!(
        sink.inserts_into("T"),
        vec![
            "INSERT INTO T (id) SETTINGS async_insert=1, wait_for_async_insert=1 \
             VALUES ('A'), ('B'), ('C')"
        ]
    );
}

#[tokio::test]
async fn should_keep_rows_enqueued_during_flush_for_next_snapshot() {
    // given
    let (sink, started_rx, unblock_tx) = InMemorySink::with_exec_gate();
    let sink = Arc::new(sink);
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    buffer.enqueue("T", row("A"), &id_columns()).await;
    buffer.enqueue("T", row("B"), &id_columns()).await;
    let flushing = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.flush(&NoopHooks).await })
    };
    started_rx.await.unwrap();

    // when
    let pending_at_write = buffer.pending_rows("T");
    buffer.enqueue("T", row("C"), &id_columns()).await;
    unblock_tx.send(()).await.unwrap();
    let first = flushing.await.unwrap();
    let pending_after_first = buffer.pending_rows("T");
    let second = buffer.flush(&NoopHooks).await;

    // then
    assert_eq!(pending_at_write, 0);
    assert_eq!(pending_after_first, 1);
    assert_eq!(first.rows, 2);
    assert_eq!(second.rows, 1);
    let inserts = sink.inserts_into("T");
    assert_eq!(inserts.len(), 2);
    assert!(inserts[0].ends_with("VALUES ('A'), ('B')"));
    assert!(inserts[1].ends_with("VALUES ('C')"));
}

#[tokio::test(start_paused = true)]
async fn should_throttle_producer_until_flush_swaps_buffer() {
    // given
    let sink = Arc::new(InMemorySink::new().with_exec_delay(Duration::from_secs(3)));
    let config = BufferConfig {
        flush_interval: Duration::from_secs(1),
        high_water_mark: 5,
        backpressure_poll_interval: Duration::from_secs(5),
        ..Default::default()
    };
    let buffer = WriteBehindBuffer::new(sink.clone(), config);
    buffer.start(Arc::new(NoopHooks));

    // when
    let producer = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            for i in 0..6 {
                buffer
                    .enqueue("T", row(&format!("r{}", i)), &id_columns())
                    .await;
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    let blocked = !producer.is_finished();
    let pending_while_blocked = buffer.pending_rows("T");
    // the flush at 1s swaps the buffer; its write completes at 4s
    tokio::time::sleep(Duration::from_millis(600)).await;

    // then
    assert!(blocked);
    assert_eq!(pending_while_blocked, 6);
    assert!(producer.is_finished());
    assert_eq!(buffer.pending_rows("T"), 0);
    assert!(sink.statements().is_empty());

    buffer.stop();
    buffer.join().await.unwrap();
    assert_eq!(sink.inserts_into("T").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn should_run_single_flush_loop_when_started_twice() {
    // given
    let sink = Arc::new(InMemorySink::new());
    let config = BufferConfig {
        flush_interval: Duration::from_secs(10),
        ..Default::default()
    };
    let buffer = WriteBehindBuffer::new(sink, config);
    let first = Arc::new(CountingHooks::default());
    let second = Arc::new(CountingHooks::default());

    // when
    buffer.start(first.clone());
    buffer.start(second.clone());
    tokio::time::sleep(Duration::from_secs(35)).await;

    // then
    assert_eq!(first.cycles(), 3);
    assert_eq!(second.cycles(), 0);
    buffer.stop();
    buffer.join().await.unwrap();
}

#[tokio::test]
async fn should_confirm_position_captured_before_flush() {
    // given
    let (sink, started_rx, unblock_tx) = InMemorySink::with_exec_gate();
    let sink = Arc::new(sink);
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    let checkpoints = Arc::new(CheckpointCoordinator::new(
        sink.clone(),
        buffer.clone(),
        CheckpointConfig::default(),
    ));
    for (id, cursor) in [("A", "p1"), ("B", "p2"), ("C", "p3")] {
        buffer.enqueue("T", row(id), &id_columns()).await;
        checkpoints.advance("s", Position::from(cursor));
    }
    let flushing = {
        let buffer = buffer.clone();
        let checkpoints = checkpoints.clone();
        tokio::spawn(async move { buffer.flush(checkpoints.as_ref()).await })
    };
    started_rx.await.unwrap();

    // when
    let state_during_write = checkpoints.state("s");
    buffer.enqueue("T", row("D"), &id_columns()).await;
    checkpoints.advance("s", Position::from("p4"));
    unblock_tx.send(()).await.unwrap();
    flushing.await.unwrap();

    // then
    assert_eq!(
        state_during_write,
        CheckpointState::Pending(Position::from("p3"))
    );
    assert_eq!(checkpoints.confirmed("s"), Some(Position::from("p3")));
    // the checkpoint row waits in the buffer for the next cycle
    assert_eq!(buffer.pending_rows(checkpoints.table()), 1);
    assert!(sink.inserts_into(checkpoints.table()).is_empty());

    // when
    buffer.flush(checkpoints.as_ref()).await;

    // then
    let written = sink.inserts_into(checkpoints.table());
    assert_eq!(written.len(), 1);
    assert!(written[0].contains("VALUES ('s','p3',"));
    assert_eq!(checkpoints.confirmed("s"), Some(Position::from("p4")));
}

#[tokio::test]
async fn should_cold_start_from_initial_position() {
    // given
    let sink = Arc::new(InMemorySink::new());
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    let checkpoints =
        CheckpointCoordinator::new(sink.clone(), buffer, CheckpointConfig::default());

    // when
    let position = checkpoints.resume("s").await.unwrap();

    // then
    assert!(position.is_initial());
    assert_eq!(checkpoints.state("s"), CheckpointState::NoCheckpoint);
    let statements = sink.statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS ingest_checkpoints"));
}

#[tokio::test]
async fn should_drop_only_malformed_row_and_still_checkpoint() {
    // given
    let sink = Arc::new(InMemorySink::new().fail_when(|q| q.contains("'poison'")));
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    let checkpoints = Arc::new(CheckpointCoordinator::new(
        sink.clone(),
        buffer.clone(),
        CheckpointConfig::default(),
    ));
    for (i, id) in ["r0", "r1", "r2", "r3", "r4", "poison", "r6", "r7"]
        .into_iter()
        .enumerate()
    {
        buffer.enqueue("T", row(id), &id_columns()).await;
        checkpoints.advance("s", Position::new(format!("c{}", i)));
    }

    // when
    let summary = buffer.flush(checkpoints.as_ref()).await;

    // then
    assert_eq!(summary.written, 7);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].table, "T");
    assert_eq!(checkpoints.confirmed("s"), Some(Position::from("c7")));
}

#[tokio::test]
async fn should_not_checkpoint_past_rows_lost_to_outage() {
    // given
    let sink = Arc::new(InMemorySink::new());
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    let checkpoints = Arc::new(CheckpointCoordinator::new(
        sink.clone(),
        buffer.clone(),
        CheckpointConfig::default(),
    ));
    buffer.enqueue("T", row("A"), &id_columns()).await;
    checkpoints.advance("s", Position::from("p1"));
    buffer.enqueue("T", row("B"), &id_columns()).await;
    checkpoints.advance("s", Position::from("p2"));

    // when
    sink.set_unavailable(true);
    let outage = buffer.flush(checkpoints.as_ref()).await;
    let state_after_outage = checkpoints.state("s");
    sink.set_unavailable(false);
    let recovery = buffer.flush(checkpoints.as_ref()).await;
    buffer.flush(checkpoints.as_ref()).await;

    // then
    assert_eq!(outage.written, 0);
    assert_eq!(outage.deferred, 2);
    assert_eq!(
        state_after_outage,
        CheckpointState::Pending(Position::from("p2"))
    );
    assert_eq!(recovery.written, 2);
    assert_eq!(checkpoints.confirmed("s"), Some(Position::from("p2")));
    let data = sink.inserts_into("T");
    assert_eq!(data.len(), 1);
    assert!(data[0].ends_with("VALUES ('A'), ('B')"));
    let written = sink.inserts_into(checkpoints.table());
    assert_eq!(written.len(), 1);
    assert!(written[0].contains("VALUES ('s','p2',"));
}

#[tokio::test]
async fn should_hold_checkpoint_only_for_stream_with_unreachable_table() {
    // given
    let down = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let sink = {
        let down = down.clone();
        Arc::new(InMemorySink::new().with_failure(move |q| {
            (q.starts_with("INSERT INTO T1 ") && down.load(Ordering::SeqCst))
                .then(|| SinkError::Connection("connection refused".to_string()))
        }))
    };
    let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
    let checkpoints = Arc::new(CheckpointCoordinator::new(
        sink.clone(),
        buffer.clone(),
        CheckpointConfig::default(),
    ));
    checkpoints.track("s1", "T1");
    checkpoints.track("s2", "T2");
    buffer.enqueue("T1", row("x"), &id_columns()).await;
    checkpoints.advance("s1", Position::from("x1"));
    buffer.enqueue("T2", row("y"), &id_columns()).await;
    checkpoints.advance("s2", Position::from("y1"));

    // when
    let partial = buffer.flush(checkpoints.as_ref()).await;

    // then
    assert_eq!(partial.written, 1);
    assert_eq!(partial.deferred, 1);
    assert_eq!(checkpoints.confirmed("s1"), None);
    assert_eq!(checkpoints.confirmed("s2"), Some(Position::from("y1")));
    assert_eq!(buffer.pending_rows("T1"), 1);

    // when
    down.store(false, Ordering::SeqCst);
    buffer.flush(checkpoints.as_ref()).await;

    // then
    assert_eq!(sink.inserts_into("T1").len(), 1);
    assert_eq!(checkpoints.confirmed("s1"), Some(Position::from("x1")));
}
