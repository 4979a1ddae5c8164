//! Durable bulk ingestion into ClickHouse.
//!
//! Rows produced by stream [`Indexer`]s are accumulated in a
//! [`WriteBehindBuffer`] and written in bulk on a timer by a [`BatchWriter`],
//! which bisects failed batches to isolate and drop malformed rows. A
//! [`CheckpointCoordinator`] hooks into the buffer's flush cycle so a stream's
//! persisted position never runs ahead of its flushed rows, giving
//! at-least-once delivery across restarts.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use common::sink::in_memory::InMemorySink;
//! use ingest::{BufferConfig, CheckpointCoordinator, CheckpointConfig, Value, WriteBehindBuffer};
//!
//! let sink = Arc::new(InMemorySink::new());
//! let buffer = WriteBehindBuffer::new(sink.clone(), BufferConfig::default());
//! let checkpoints = Arc::new(CheckpointCoordinator::new(
//!     sink,
//!     buffer.clone(),
//!     CheckpointConfig::default(),
//! ));
//! buffer.start(checkpoints.clone());
//!
//! buffer.enqueue("events", vec![Value::from("a")], &["id".to_string()]).await;
//! checkpoints.advance("events", "cursor-1".into());
//! ```

pub mod balances;
pub mod buffer;
pub mod checkpoint;
pub mod config;
mod error;
pub mod indexer;
pub mod metrics;
mod model;
pub mod queue;
pub mod server;
pub mod shape;
pub mod source;
pub mod writer;

pub use buffer::{
    BufferConfig, Deferral, DestinationFailure, FlushHooks, FlushSummary, NoopHooks,
    WriteBehindBuffer,
};
pub use checkpoint::{CheckpointConfig, CheckpointCoordinator, CheckpointState};
pub use error::{Error, Result};
pub use indexer::{Indexer, PollIntervals};
pub use metrics::Metrics;
pub use model::{Position, Row, Value, is_array_literal};
pub use queue::{BackgroundTaskQueue, BoxError, QueueConfig};
pub use writer::{BatchWriter, RowFailure, WriteReport};
