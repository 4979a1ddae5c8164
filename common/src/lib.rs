//! Shared infrastructure for the ingestion workspace.
//!
//! This crate holds the pieces every ingester needs but that are not specific
//! to buffering: a [`Clock`] abstraction for timestamps and the [`Sink`]
//! interface to the columnar store, with a ClickHouse HTTP implementation and
//! an in-memory implementation for tests.

pub mod clock;
pub mod sink;

pub use clock::{Clock, MockClock, SystemClock};
pub use sink::config::SinkConfig;
pub use sink::{QueryRow, Sink, SinkError, SinkResult};
