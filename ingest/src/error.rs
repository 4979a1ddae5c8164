//! Error types for the ingestion pipeline.

use common::SinkError;
use thiserror::Error;

/// Errors returned by ingestion operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A statement or query against the sink failed.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Rows of a destination were rejected even in isolation and dropped.
    #[error("{rejected} row(s) rejected writing {table}: {first}")]
    RowsRejected {
        table: String,
        rejected: usize,
        first: SinkError,
    },

    /// The remote source failed or returned an unusable page.
    #[error("source error: {0}")]
    Source(String),

    /// Configuration could not be loaded or is invalid.
    #[error("invalid config: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Config(msg.to_string())
    }
}

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, Error>;
