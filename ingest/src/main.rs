//! Ingestion binary entry point.

use std::sync::Arc;

use clap::Parser;
use common::{SinkConfig, SystemClock};
use common::sink::factory::create_sink;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ingest::balances::{BalanceRefresher, GatewayBalances};
use ingest::config::{CliArgs, Config, load_config};
use ingest::server::{MetricsServer, shutdown_signal};
use ingest::source::GraphqlSource;
use ingest::{
    BackgroundTaskQueue, CheckpointCoordinator, Indexer, Metrics, Result, WriteBehindBuffer,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();

    if let Err(e) = run(args).await {
        tracing::error!("ingest failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if args.metrics_port.is_some() {
        config.metrics_port = args.metrics_port;
    }
    if config.streams.is_empty() {
        tracing::warn!("no streams configured");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    if !config.startup_delay.is_zero() {
        tracing::info!("sleeping {:?} before connecting", config.startup_delay);
        tokio::select! {
            _ = tokio::time::sleep(config.startup_delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }

    match &config.sink {
        SinkConfig::ClickHouse(ch) => {
            tracing::info!(url = %ch.url, database = %ch.database, "connecting to ClickHouse")
        }
        SinkConfig::InMemory => tracing::info!("using in-memory sink"),
    }
    let sink = create_sink(&config.sink).await?;

    let metrics = Arc::new(Metrics::new());
    let buffer = WriteBehindBuffer::with_metrics(sink.clone(), config.buffer.clone(), metrics.clone());
    let checkpoints = Arc::new(CheckpointCoordinator::new(
        sink.clone(),
        buffer.clone(),
        config.checkpoint.clone(),
    ));
    let queue = BackgroundTaskQueue::start(config.queue.clone(), metrics.clone());

    let mut indexers = Vec::with_capacity(config.streams.len());
    for stream in &config.streams {
        let source = Arc::new(GraphqlSource::new(
            &stream.endpoint,
            &stream.tags,
            stream.page_size,
            stream.shape.needs_quantity(),
        ));
        let mut indexer = Indexer::new(stream, source, buffer.clone(), checkpoints.clone());
        if let Some(balances) = &stream.balances {
            indexer = indexer.with_balances(BalanceRefresher::new(
                Arc::new(GatewayBalances::new(&balances.gateway)),
                buffer.clone(),
                queue.clone(),
                Arc::new(SystemClock),
                &balances.table,
            ));
        }
        indexer.provision(sink.as_ref()).await?;
        indexers.push(indexer);
    }

    buffer.start(checkpoints.clone());

    if let Some(port) = config.metrics_port {
        let server = MetricsServer::new(metrics.clone(), port);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                tracing::error!("{}", e);
            }
        });
    }

    let mut tasks = JoinSet::new();
    for indexer in indexers {
        let cancel = shutdown.child_token();
        tasks.spawn(async move {
            let name = indexer.name().to_string();
            (name, indexer.run(cancel).await)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => tracing::info!(stream = %name, "indexer exited"),
            Ok((name, Err(e))) => tracing::error!(stream = %name, error = %e, "indexer failed"),
            Err(e) => tracing::error!(error = %e, "indexer panicked"),
        }
    }

    // unflushed rows are re-fetched on restart since their checkpoints were
    // never confirmed
    shutdown.cancel();
    buffer.stop();
    queue.stop();
    buffer.join().await?;
    queue.join().await?;
    tracing::info!(
        pending = ?buffer.pending_destinations(),
        "shut down"
    );
    Ok(())
}
