//! Sink configuration types.
//!
//! Services select and configure their sink through this enum, loaded from
//! the service's YAML configuration file.

use serde::{Deserialize, Serialize};

/// Top-level sink configuration.
///
/// Defaults to a ClickHouse server on `http://localhost:8123`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SinkConfig {
    InMemory,
    ClickHouse(ClickHouseConfig),
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::ClickHouse(ClickHouseConfig::default())
    }
}

/// ClickHouse HTTP interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface, e.g. `http://localhost:8123`.
    pub url: String,

    /// Database that statements run against.
    #[serde(default = "default_database")]
    pub database: String,

    /// Optional user name, sent as `X-ClickHouse-User`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Optional password, sent as `X-ClickHouse-Key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Number of ping attempts made before giving up at startup.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between ping attempts, in milliseconds.
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
}

fn default_database() -> String {
    "default".to_string()
}

fn default_connect_retries() -> u32 {
    10
}

fn default_connect_delay_ms() -> u64 {
    1000
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: default_database(),
            user: None,
            password: None,
            connect_retries: default_connect_retries(),
            connect_delay_ms: default_connect_delay_ms(),
        }
    }
}
