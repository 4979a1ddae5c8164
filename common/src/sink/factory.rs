//! Sink factory for creating sinks from configuration.

use std::sync::Arc;
use std::time::Duration;

use super::clickhouse::ClickHouseSink;
use super::config::SinkConfig;
use super::in_memory::InMemorySink;
use super::{Sink, SinkError, SinkResult};

/// Creates a sink from configuration and waits until it answers a ping.
///
/// ClickHouse sinks are pinged up to `connect_retries` times, sleeping
/// `connect_delay_ms` between attempts. The last error is returned if the
/// sink never becomes reachable.
///
/// # Examples
///
/// ```rust,ignore
/// use common::sink::config::SinkConfig;
/// use common::sink::factory::create_sink;
///
/// let sink = create_sink(&SinkConfig::InMemory).await?;
/// ```
pub async fn create_sink(config: &SinkConfig) -> SinkResult<Arc<dyn Sink>> {
    match config {
        SinkConfig::InMemory => Ok(Arc::new(InMemorySink::new())),
        SinkConfig::ClickHouse(ch_config) => {
            let sink: Arc<dyn Sink> = Arc::new(ClickHouseSink::new(ch_config.clone()));
            connect_with_retry(
                sink.as_ref(),
                ch_config.connect_retries,
                Duration::from_millis(ch_config.connect_delay_ms),
            )
            .await?;
            Ok(sink)
        }
    }
}

/// Pings `sink` until it answers or `retries` attempts have failed.
pub async fn connect_with_retry(sink: &dyn Sink, retries: u32, delay: Duration) -> SinkResult<()> {
    let attempts = retries.max(1);
    let mut last_err = SinkError::Connection("no connection attempt made".to_string());
    for attempt in 1..=attempts {
        match sink.ping().await {
            Ok(()) => {
                tracing::info!(attempt, "connected to sink");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "error connecting to sink");
                last_err = e;
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::in_memory::InMemorySink;

    #[tokio::test]
    async fn should_create_in_memory_sink() {
        // given
        let config = SinkConfig::InMemory;

        // when
        let sink = create_sink(&config).await.unwrap();

        // then
        assert!(sink.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_after_configured_retries() {
        // given
        let sink = InMemorySink::new();
        sink.set_unavailable(true);

        // when
        let result = connect_with_retry(&sink, 3, Duration::from_secs(1)).await;

        // then
        assert!(matches!(result, Err(SinkError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn should_connect_once_sink_recovers() {
        // given
        let sink = Arc::new(InMemorySink::new());
        sink.set_unavailable(true);
        let recover = {
            let sink = sink.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                sink.set_unavailable(false);
            })
        };

        // when
        let result = connect_with_retry(sink.as_ref(), 5, Duration::from_secs(1)).await;

        // then
        assert!(result.is_ok());
        recover.await.unwrap();
    }
}
