//! Storage sink interface.
//!
//! A [`Sink`] is the narrow surface the ingestion core needs from the columnar
//! store: execute a statement, run a query that returns rows, and check
//! connectivity. Connection management and table layout live behind it.

pub mod clickhouse;
pub mod config;
pub mod factory;
pub mod in_memory;

use async_trait::async_trait;
use thiserror::Error;

/// A single result row, decoded from one `JSONEachRow` line.
pub type QueryRow = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by a [`Sink`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink could not be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// The sink was reached but refused the statement.
    #[error("statement rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The statement did not complete before the write deadline.
    #[error("statement timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl SinkError {
    /// True if the failure says nothing about the statement itself, so the
    /// same statement may succeed later: the sink was unreachable, overloaded
    /// or too slow.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Connection(_) | SinkError::Timeout(_) => true,
            SinkError::Rejected { status, .. } => matches!(status, 502..=504),
            SinkError::Decode(_) => false,
        }
    }
}

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// The columnar store as seen by the ingestion core.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Executes a statement that returns no rows (inserts, DDL).
    async fn exec(&self, query: &str) -> SinkResult<()>;

    /// Executes a query and returns its rows.
    async fn query(&self, query: &str) -> SinkResult<Vec<QueryRow>>;

    /// Checks that the sink is reachable.
    async fn ping(&self) -> SinkResult<()>;
}

/// Quotes a string as a single-quoted SQL literal.
///
/// Backslashes and single quotes are escaped, which is sufficient for
/// ClickHouse string literals.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}
