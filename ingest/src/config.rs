//! Configuration for the ingestion binary.

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use common::SinkConfig;
use serde::{Deserialize, Deserializer};

use crate::balances::BalancesConfig;
use crate::buffer::BufferConfig;
use crate::checkpoint::CheckpointConfig;
use crate::error::{Error, Result};
use crate::indexer::PollIntervals;
use crate::queue::QueueConfig;
use crate::shape::Shape;
use crate::source::TagFilter;

/// CLI arguments for the binary.
#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Write-behind bulk ingestion into ClickHouse")]
pub struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "INGEST_CONFIG")]
    pub config: Option<String>,

    /// Port serving /metrics, overriding the config file
    #[arg(long, env = "INGEST_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sink: SinkConfig,
    pub buffer: BufferConfig,
    pub queue: QueueConfig,
    pub checkpoint: CheckpointConfig,
    pub streams: Vec<StreamConfig>,
    /// Port serving `/metrics`; metrics are not served when unset.
    pub metrics_port: Option<u16>,
    /// Delay before connecting to the sink.
    #[serde(deserialize_with = "duration")]
    pub startup_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            buffer: BufferConfig::default(),
            queue: QueueConfig::default(),
            checkpoint: CheckpointConfig::default(),
            streams: Vec::new(),
            metrics_port: None,
            startup_delay: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.buffer.flush_interval.is_zero() {
            return Err("buffer.flush_interval must be positive".into());
        }
        if self.buffer.high_water_mark == 0 {
            return Err("buffer.high_water_mark must be positive".into());
        }
        let mut names = std::collections::HashSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate stream name: {}",
                    stream.name
                )));
            }
            if stream.page_size == 0 {
                return Err(Error::Config(format!(
                    "stream {}: page_size must be positive",
                    stream.name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for one ingested stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream name, used as the checkpoint key.
    pub name: String,
    /// GraphQL endpoint.
    pub endpoint: String,
    /// Destination table.
    pub table: String,
    #[serde(default = "default_shape")]
    pub shape: Shape,
    #[serde(default)]
    pub tags: Vec<TagFilter>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Drop tags whose value parses as JSON.
    #[serde(default)]
    pub skip_json_tags: bool,
    #[serde(default = "default_page_interval", deserialize_with = "duration")]
    pub page_interval: Duration,
    #[serde(default = "default_idle_interval", deserialize_with = "duration")]
    pub idle_interval: Duration,
    #[serde(default = "default_error_backoff", deserialize_with = "duration")]
    pub error_backoff: Duration,
    /// Refresh owner balances when set.
    #[serde(default)]
    pub balances: Option<BalancesConfig>,
}

fn default_shape() -> Shape {
    Shape::Transactions
}

fn default_page_size() -> usize {
    100
}

fn default_page_interval() -> Duration {
    PollIntervals::default().page
}

fn default_idle_interval() -> Duration {
    PollIntervals::default().idle
}

fn default_error_backoff() -> Duration {
    PollIntervals::default().error_backoff
}

impl StreamConfig {
    pub fn intervals(&self) -> PollIntervals {
        PollIntervals {
            page: self.page_interval,
            idle: self.idle_interval,
            error_backoff: self.error_backoff,
        }
    }
}

/// Load configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Parse a Prometheus-style duration string (e.g., "15s", "1m", "2h").
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    // Find where the numeric part ends
    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    if num_end == 0 {
        return Err("Duration must start with a number".into());
    }

    let value: f64 = s[..num_end]
        .parse()
        .map_err(|_| "Invalid duration number")?;
    let unit = &s[num_end..];

    let multiplier = match unit {
        "ms" => 0.001,
        "s" | "" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => {
            return Err(Error::Config(format!("Unknown duration unit: {}", unit)));
        }
    };

    Duration::try_from_secs_f64(value * multiplier)
        .map_err(|e| Error::Config(format!("Duration out of range: {}: {}", s, e)))
}

/// Deserializes a duration string with [`parse_duration`].
pub fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Deserializes an optional duration string; `null` means no duration.
pub fn optional_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
