//! Wallet balance refresh.
//!
//! Owner addresses seen by a stream are scheduled on the
//! [`BackgroundTaskQueue`]. Each task looks up the wallet's current balance
//! and buffers a row into the balances table.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::Clock;
use serde::Deserialize;
use tracing::debug;

use crate::buffer::WriteBehindBuffer;
use crate::error::{Error, Result};
use crate::model::Value;
use crate::queue::BackgroundTaskQueue;
use crate::shape::WINSTON_PER_AR;

/// Configuration for balance refresh.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BalancesConfig {
    /// Gateway serving `/wallet/<address>/balance`.
    pub gateway: String,
    pub table: String,
}

impl Default for BalancesConfig {
    fn default() -> Self {
        Self {
            gateway: "https://arweave.net".to_string(),
            table: "wallet_balances".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalletBalance {
    pub winston: u64,
    pub ar: f64,
}

/// Looks up wallet balances.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn balance(&self, address: &str) -> Result<WalletBalance>;
}

/// [`BalanceSource`] reading `GET <gateway>/wallet/<address>/balance`.
#[derive(Debug, Clone)]
pub struct GatewayBalances {
    client: reqwest::Client,
    gateway: String,
}

impl GatewayBalances {
    pub fn new(gateway: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            gateway: gateway.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BalanceSource for GatewayBalances {
    async fn balance(&self, address: &str) -> Result<WalletBalance> {
        let url = format!("{}/wallet/{}/balance", self.gateway, address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Source(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Source(format!(
                "balance lookup for {} returned status {}",
                address, status
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::Source(e.to_string()))?;
        parse_balance(&text)
    }
}

/// Parses a winston balance as returned by the gateway.
pub fn parse_balance(text: &str) -> Result<WalletBalance> {
    let winston: u64 = text
        .trim()
        .parse()
        .map_err(|_| Error::Source(format!("invalid balance received: {:?}", text)))?;
    Ok(WalletBalance {
        winston,
        ar: winston as f64 / WINSTON_PER_AR,
    })
}

/// Schedules balance lookups and buffers their results.
#[derive(Clone)]
pub struct BalanceRefresher {
    source: Arc<dyn BalanceSource>,
    buffer: WriteBehindBuffer,
    queue: BackgroundTaskQueue,
    clock: Arc<dyn Clock>,
    table: String,
    columns: Vec<String>,
}

impl BalanceRefresher {
    pub fn new(
        source: Arc<dyn BalanceSource>,
        buffer: WriteBehindBuffer,
        queue: BackgroundTaskQueue,
        clock: Arc<dyn Clock>,
        table: &str,
    ) -> Self {
        Self {
            source,
            buffer,
            queue,
            clock,
            table: table.to_string(),
            columns: vec![
                "owner_address".to_string(),
                "balance_ar".to_string(),
                "balance_winston".to_string(),
                "timestamp".to_string(),
            ],
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             owner_address String CODEC(ZSTD), \
             balance_ar Float64, \
             balance_winston UInt64, \
             timestamp DateTime DEFAULT now()\
             ) ENGINE = ReplacingMergeTree(timestamp) \
             ORDER BY (owner_address)",
            self.table
        )
    }

    /// Queues one lookup per distinct address.
    pub fn schedule<'a>(&self, addresses: impl IntoIterator<Item = &'a str>) {
        let distinct: BTreeSet<&str> = addresses.into_iter().collect();
        for address in distinct {
            let refresher = self.clone();
            let address = address.to_string();
            self.queue
                .enqueue(async move { refresher.refresh(&address).await });
        }
    }

    /// Looks up `address` and buffers its balance row.
    pub async fn refresh(&self, address: &str) -> Result<()> {
        let balance = self.source.balance(address).await?;
        debug!(address, winston = balance.winston, "refreshed wallet balance");
        let row = vec![
            Value::from(address),
            Value::Float(balance.ar),
            Value::UInt(balance.winston),
            Value::UInt(self.clock.unix_seconds()),
        ];
        self.buffer.enqueue(&self.table, row, &self.columns).await;
        Ok(())
    }
}
