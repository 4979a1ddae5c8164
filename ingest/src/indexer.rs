//! Ingestion loop for one stream.
//!
//! The [`Indexer`] resumes from the stream's checkpoint, pages through the
//! remote source, shapes each record into a row, hands it to the buffer and
//! then advances the stream's position. When the source reports no further
//! pages it idles before polling again.

use std::sync::Arc;
use std::time::Duration;

use common::Sink;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balances::BalanceRefresher;
use crate::buffer::WriteBehindBuffer;
use crate::checkpoint::CheckpointCoordinator;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::model::Position;
use crate::shape::Shape;
use crate::source::{Page, RemoteSource};

/// Sleep intervals of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollIntervals {
    /// Between pages while catching up.
    pub page: Duration,
    /// After the last page.
    pub idle: Duration,
    /// After a failed fetch.
    pub error_backoff: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            page: Duration::from_secs(2),
            idle: Duration::from_secs(12),
            error_backoff: Duration::from_secs(5),
        }
    }
}

pub struct Indexer {
    name: String,
    table: String,
    shape: Shape,
    skip_json_tags: bool,
    columns: Vec<String>,
    intervals: PollIntervals,
    source: Arc<dyn RemoteSource>,
    buffer: WriteBehindBuffer,
    checkpoints: Arc<CheckpointCoordinator>,
    balances: Option<BalanceRefresher>,
}

impl Indexer {
    pub fn new(
        config: &StreamConfig,
        source: Arc<dyn RemoteSource>,
        buffer: WriteBehindBuffer,
        checkpoints: Arc<CheckpointCoordinator>,
    ) -> Self {
        checkpoints.track(&config.name, &config.table);
        Self {
            name: config.name.clone(),
            table: config.table.clone(),
            shape: config.shape,
            skip_json_tags: config.skip_json_tags,
            columns: config.shape.columns(),
            intervals: config.intervals(),
            source,
            buffer,
            checkpoints,
            balances: None,
        }
    }

    /// Refreshes the balance of every owner seen on a page.
    pub fn with_balances(mut self, balances: BalanceRefresher) -> Self {
        self.balances = Some(balances);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates the stream's destination tables if they do not exist.
    pub async fn provision(&self, sink: &dyn Sink) -> Result<()> {
        sink.exec(&self.shape.create_table_sql(&self.table)).await?;
        if let Some(balances) = &self.balances {
            sink.exec(&balances.create_table_sql()).await?;
        }
        Ok(())
    }

    /// Runs the ingestion loop until `cancel` fires.
    ///
    /// Only reading the checkpoint can fail the loop; fetch errors are logged
    /// and retried after the error backoff.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut cursor = self.checkpoints.resume(&self.name).await?;
        info!(stream = %self.name, cursor = %cursor, "resuming stream");

        loop {
            let fetched = tokio::select! {
                fetched = self.source.fetch_page(&cursor) => fetched,
                _ = cancel.cancelled() => break,
            };
            let wait = match fetched {
                Ok(page) => {
                    let has_next_page = page.has_next_page;
                    if let Some(last) = self.ingest_page(page).await {
                        cursor = last;
                    }
                    if has_next_page {
                        self.intervals.page
                    } else {
                        debug!(stream = %self.name, "caught up, idling");
                        self.intervals.idle
                    }
                }
                Err(e) => {
                    warn!(stream = %self.name, cursor = %cursor, error = %e, "error fetching page");
                    self.intervals.error_backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!(stream = %self.name, "stream stopped");
        Ok(())
    }

    /// Buffers a page's rows, advancing the stream past each record.
    ///
    /// Returns the cursor of the page's last record, if any.
    pub async fn ingest_page(&self, page: Page) -> Option<Position> {
        let last = page.last_cursor();
        let mut rows = 0;
        for edge in &page.edges {
            if let Some(row) = self.shape.shape(&edge.node, self.skip_json_tags) {
                self.buffer.enqueue(&self.table, row, &self.columns).await;
                rows += 1;
            }
            self.checkpoints
                .advance(&self.name, Position::new(edge.cursor.clone()));
        }
        if let Some(balances) = &self.balances {
            balances.schedule(page.edges.iter().map(|e| e.node.owner.address.as_str()));
        }
        if !page.edges.is_empty() {
            debug!(
                stream = %self.name,
                edges = page.edges.len(),
                rows,
                "buffered page"
            );
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, DestinationFailure, FlushHooks, FlushSummary};
    use crate::checkpoint::{CheckpointConfig, CheckpointState};
    use crate::error::Error;
    use crate::source::{Block, Edge, Owner, TransactionNode};
    use async_trait::async_trait;
    use common::SinkError;
    use common::sink::in_memory::InMemorySink;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<Page>>>,
        requested: Mutex<Vec<Position>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<Page>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedSource {
        async fn fetch_page(&self, after: &Position) -> Result<Page> {
            self.requested.lock().unwrap().push(after.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::default()))
        }
    }

    fn edge(cursor: &str, id: &str, pending: bool) -> Edge {
        Edge {
            cursor: cursor.to_string(),
            node: TransactionNode {
                id: id.to_string(),
                owner: Owner {
                    address: format!("owner-{}", id),
                },
                tags: vec![],
                block: (!pending).then_some(Block {
                    height: 1,
                    timestamp: 1_700_000_000,
                }),
                quantity: None,
            },
        }
    }

    fn stream_config() -> StreamConfig {
        serde_yaml::from_str("name: s\ntable: txs\nendpoint: http://localhost/graphql\n").unwrap()
    }

    fn indexer(source: Arc<ScriptedSource>) -> (Indexer, WriteBehindBuffer, Arc<CheckpointCoordinator>) {
        let sink = Arc::new(InMemorySink::new());
        let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
        let checkpoints = Arc::new(CheckpointCoordinator::new(
            sink,
            buffer.clone(),
            CheckpointConfig::default(),
        ));
        let indexer = Indexer::new(&stream_config(), source, buffer.clone(), checkpoints.clone());
        (indexer, buffer, checkpoints)
    }

    #[tokio::test]
    async fn should_skip_pending_records_but_advance_past_them() {
        // given
        let (indexer, buffer, checkpoints) = indexer(Arc::new(ScriptedSource::new(vec![])));
        let page = Page {
            has_next_page: false,
            edges: vec![edge("c1", "tx1", false), edge("c2", "tx2", true)],
        };

        // when
        let last = indexer.ingest_page(page).await;

        // then
        assert_eq!(last, Some(Position::from("c2")));
        assert_eq!(buffer.pending_rows("txs"), 1);
        assert_eq!(checkpoints.current("s"), Position::from("c2"));
    }

    #[tokio::test]
    async fn should_hold_checkpoint_while_stream_table_is_unwritten() {
        // given
        let (indexer, buffer, checkpoints) = indexer(Arc::new(ScriptedSource::new(vec![])));
        let failing = FlushSummary {
            destinations: 2,
            rows: 2,
            written: 1,
            failures: vec![DestinationFailure {
                table: "txs".to_string(),
                rows: 1,
                rejected: 1,
                error: SinkError::Rejected {
                    status: 400,
                    message: "cannot parse".to_string(),
                },
            }],
            ..Default::default()
        };
        indexer
            .ingest_page(Page {
                has_next_page: false,
                edges: vec![edge("c1", "tx1", false)],
            })
            .await;

        // when
        checkpoints.before_flush().await;
        checkpoints.after_flush(&failing).await;

        // then
        assert_eq!(
            checkpoints.state("s"),
            CheckpointState::Pending(Position::from("c1"))
        );
        assert_eq!(buffer.pending_rows(checkpoints.table()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_page_from_last_cursor_and_back_off_on_errors() {
        // given
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(Page {
                has_next_page: true,
                edges: vec![edge("c1", "tx1", false), edge("c2", "tx2", false)],
            }),
            Err(Error::Source("gateway timeout".to_string())),
            Ok(Page {
                has_next_page: false,
                edges: vec![edge("c3", "tx3", false)],
            }),
        ]));
        let (indexer, buffer, checkpoints) = indexer(source.clone());
        let cancel = CancellationToken::new();

        // when
        let run = {
            let cancel = cancel.clone();
            async move { indexer.run(cancel).await }
        };
        let stop = async {
            // page (2s) + backoff (5s) + last page, then idle
            tokio::time::sleep(Duration::from_secs(10)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(run, stop);

        // then
        result.unwrap();
        let requested = source.requested.lock().unwrap().clone();
        assert_eq!(
            requested,
            vec![
                Position::initial(),
                Position::from("c2"),
                Position::from("c2")
            ]
        );
        assert_eq!(buffer.pending_rows("txs"), 3);
        assert_eq!(checkpoints.current("s"), Position::from("c3"));
    }
}
