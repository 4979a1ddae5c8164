//! Sequential background task runner.
//!
//! [`BackgroundTaskQueue`] runs enqueued async tasks one at a time in FIFO
//! order on a single worker. Each task runs in its own spawned task so a
//! returned error or a panic is logged and the queue moves on.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Error type returned by queued tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Task = BoxFuture<'static, std::result::Result<(), BoxError>>;

/// Configuration for the background task queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long the idle worker sleeps before re-checking the queue when no
    /// new-task notification arrives.
    #[serde(deserialize_with = "crate::config::duration")]
    pub idle_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_secs(10),
        }
    }
}

struct Inner {
    tasks: Mutex<VecDeque<Task>>,
    added: Notify,
    stop_tok: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

/// Single-worker FIFO queue of async tasks.
///
/// Cloning is cheap; clones share the same queue and worker.
#[derive(Clone)]
pub struct BackgroundTaskQueue {
    inner: Arc<Inner>,
}

impl BackgroundTaskQueue {
    /// Creates the queue and spawns its worker.
    pub fn start(config: QueueConfig, metrics: Arc<Metrics>) -> Self {
        let inner = Arc::new(Inner {
            tasks: Mutex::new(VecDeque::new()),
            added: Notify::new(),
            stop_tok: CancellationToken::new(),
            worker: Mutex::new(None),
            metrics,
        });
        let handle = tokio::spawn(Self::run(inner.clone(), config.idle_poll_interval));
        *inner.worker.lock().expect("lock poisoned") = Some(handle);
        Self { inner }
    }

    /// Appends `task` to the queue.
    pub fn enqueue<F, E>(&self, task: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let task: Task = task.map(|r| r.map_err(Into::into)).boxed();
        self.inner
            .tasks
            .lock()
            .expect("lock poisoned")
            .push_back(task);
        self.inner.added.notify_one();
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals the worker to exit once its current task finishes.
    ///
    /// Queued tasks that have not started are left in the queue.
    pub fn stop(&self) {
        self.inner.stop_tok.cancel();
    }

    /// Waits for a stopped worker to exit.
    pub async fn join(&self) -> Result<()> {
        let handle = self.inner.worker.lock().expect("lock poisoned").take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("queue worker panicked: {}", e))),
            None => Ok(()),
        }
    }

    async fn run(inner: Arc<Inner>, idle_poll_interval: Duration) {
        loop {
            while !inner.stop_tok.is_cancelled() {
                let next = inner.tasks.lock().expect("lock poisoned").pop_front();
                let Some(task) = next else {
                    break;
                };
                Self::execute(&inner, task).await;
            }

            tokio::select! {
                _ = inner.added.notified() => {}
                _ = tokio::time::sleep(idle_poll_interval) => {}
                _ = inner.stop_tok.cancelled() => {
                    break;
                }
            }
        }
        debug!("queue worker stopped");
    }

    async fn execute(inner: &Inner, task: Task) {
        match tokio::spawn(task).await {
            Ok(Ok(())) => {
                inner.metrics.tasks_completed_total.inc();
            }
            Ok(Err(e)) => {
                inner.metrics.tasks_failed_total.inc();
                error!(error = %e, "error processing task");
            }
            Err(e) => {
                inner.metrics.tasks_failed_total.inc();
                error!(error = %e, "task panicked");
            }
        }
    }
}
