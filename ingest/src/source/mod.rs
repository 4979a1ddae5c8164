//! Remote paginated record sources.

pub mod graphql;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::model::Position;

pub use graphql::GraphqlSource;

/// One page of records returned by a [`RemoteSource`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub has_next_page: bool,
    pub edges: Vec<Edge>,
}

impl Page {
    /// Cursor of the last edge on the page.
    pub fn last_cursor(&self) -> Option<Position> {
        self.edges.last().map(|edge| Position::new(edge.cursor.clone()))
    }
}

/// A record together with its pagination cursor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Edge {
    pub cursor: String,
    pub node: TransactionNode,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionNode {
    pub id: String,
    pub owner: Owner,
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// `None` while the transaction is pending.
    #[serde(default)]
    pub block: Option<Block>,
    #[serde(default)]
    pub quantity: Option<Quantity>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Owner {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Block {
    pub height: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Quantity {
    pub winston: String,
    pub ar: String,
}

/// Tag constraint applied by the source: a record matches if its tag `name`
/// has one of `values`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TagFilter {
    pub name: String,
    pub values: Vec<String>,
}

/// A paginated source of records ordered by a monotonically advancing cursor.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches the page of records following `after`. The initial position
    /// fetches from the beginning.
    async fn fetch_page(&self, after: &Position) -> Result<Page>;
}
