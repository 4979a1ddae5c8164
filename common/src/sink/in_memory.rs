//! In-memory sink for tests and dry runs.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{QueryRow, Sink, SinkError, SinkResult};

type FailureFn = Box<dyn Fn(&str) -> Option<SinkError> + Send + Sync>;
type ResponderFn = Box<dyn Fn(&str) -> SinkResult<Vec<QueryRow>> + Send + Sync>;

#[derive(Default)]
struct InMemorySinkState {
    statements: Vec<String>,
    queries: Vec<String>,
    exec_attempts: usize,
    unavailable: bool,
    failure: Option<FailureFn>,
    responder: Option<ResponderFn>,
    /// Signals when the first gated exec starts.
    exec_started_tx: Option<oneshot::Sender<()>>,
    /// Blocks the first gated exec until signaled.
    unblock_rx: Option<mpsc::Receiver<()>>,
}

/// A [`Sink`] that records accepted statements in memory.
///
/// Failures and query results are injected with closures so tests can model
/// poison rows, outages and existing checkpoint tables. Accepted statements
/// are kept in submission order.
#[derive(Default)]
pub struct InMemorySink {
    state: Mutex<InMemorySinkState>,
    exec_delay: Option<Duration>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every `exec` whose statement matches `predicate`.
    pub fn fail_when<F>(self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.with_failure(move |query| {
            predicate(query).then(|| SinkError::Rejected {
                status: 400,
                message: "injected failure".to_string(),
            })
        })
    }

    /// Installs a closure deciding, per statement, whether `exec` fails.
    pub fn with_failure<F>(self, failure: F) -> Self
    where
        F: Fn(&str) -> Option<SinkError> + Send + Sync + 'static,
    {
        self.state.lock().expect("lock poisoned").failure = Some(Box::new(failure));
        self
    }

    /// Installs a closure answering `query` calls.
    ///
    /// Without a responder every query returns no rows.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> SinkResult<Vec<QueryRow>> + Send + Sync + 'static,
    {
        self.state.lock().expect("lock poisoned").responder = Some(Box::new(responder));
        self
    }

    /// Delays every `exec` by `delay`.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Creates a sink whose first `exec` blocks until signaled.
    ///
    /// Returns (sink, exec_started_rx, unblock_tx).
    pub fn with_exec_gate() -> (Self, oneshot::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (unblock_tx, unblock_rx) = mpsc::channel(1);
        let sink = Self::default();
        {
            let mut state = sink.state.lock().expect("lock poisoned");
            state.exec_started_tx = Some(started_tx);
            state.unblock_rx = Some(unblock_rx);
        }
        (sink, started_rx, unblock_tx)
    }

    /// Makes every subsequent `exec`, `query` and `ping` fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().expect("lock poisoned").unavailable = unavailable;
    }

    /// Statements accepted by `exec`, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").statements.clone()
    }

    /// Accepted `INSERT` statements targeting `table`.
    pub fn inserts_into(&self, table: &str) -> Vec<String> {
        let prefix = format!("INSERT INTO {} ", table);
        self.statements()
            .into_iter()
            .filter(|s| s.starts_with(&prefix))
            .collect()
    }

    /// Queries received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").queries.clone()
    }

    /// Number of `exec` calls, successful or not.
    pub fn exec_attempts(&self) -> usize {
        self.state.lock().expect("lock poisoned").exec_attempts
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn exec(&self, query: &str) -> SinkResult<()> {
        let (started_tx, unblock_rx) = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.exec_attempts += 1;
            (state.exec_started_tx.take(), state.unblock_rx.take())
        };
        if let Some(tx) = started_tx {
            let _ = tx.send(());
        }
        if let Some(mut rx) = unblock_rx {
            rx.recv().await;
        }
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().expect("lock poisoned");
        if state.unavailable {
            return Err(SinkError::Connection("sink unavailable".to_string()));
        }
        if let Some(err) = state.failure.as_ref().and_then(|f| f(query)) {
            return Err(err);
        }
        state.statements.push(query.to_string());
        Ok(())
    }

    async fn query(&self, query: &str) -> SinkResult<Vec<QueryRow>> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.unavailable {
            return Err(SinkError::Connection("sink unavailable".to_string()));
        }
        state.queries.push(query.to_string());
        match &state.responder {
            Some(responder) => responder(query),
            None => Ok(Vec::new()),
        }
    }

    async fn ping(&self) -> SinkResult<()> {
        if self.state.lock().expect("lock poisoned").unavailable {
            return Err(SinkError::Connection("sink unavailable".to_string()));
        }
        Ok(())
    }
}
