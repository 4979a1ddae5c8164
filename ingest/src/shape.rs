//! Shaping of source records into destination rows.

use common::sink::quote_literal;
use serde::Deserialize;

use crate::model::{Row, Value};
use crate::source::{Tag, TransactionNode};

/// Winston per AR.
pub const WINSTON_PER_AR: f64 = 1_000_000_000_000.0;

/// Row layout written for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// Transactions with owner, block and tags.
    Transactions,
    /// Transactions plus the transferred quantity.
    Transfers,
}

impl Shape {
    pub fn columns(&self) -> Vec<String> {
        let names: &[&str] = match self {
            Shape::Transactions => &[
                "id",
                "owner_address",
                "block_height",
                "block_timestamp",
                "tags",
            ],
            Shape::Transfers => &[
                "id",
                "owner_address",
                "block_height",
                "block_timestamp",
                "quantity_winston",
                "quantity_ar",
                "tags",
            ],
        };
        names.iter().map(|n| n.to_string()).collect()
    }

    /// True if the source must select transaction quantities.
    pub fn needs_quantity(&self) -> bool {
        matches!(self, Shape::Transfers)
    }

    /// DDL creating `table` for this shape.
    pub fn create_table_sql(&self, table: &str) -> String {
        let (quantity_columns, order_by) = match self {
            Shape::Transactions => ("", "id, owner_address, block_timestamp"),
            Shape::Transfers => (
                "quantity_winston UInt64 CODEC(Delta, ZSTD), \
                 quantity_ar Float64 CODEC(Delta, ZSTD), ",
                "id, owner_address, quantity_ar, block_timestamp",
            ),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id String CODEC(ZSTD), \
             owner_address String CODEC(ZSTD), \
             block_height UInt64 CODEC(Delta, ZSTD), \
             block_timestamp DateTime CODEC(Delta, ZSTD), \
             {}\
             tags Array(Tuple(String, String)) CODEC(ZSTD)\
             ) ENGINE = ReplacingMergeTree() \
             PARTITION BY toYYYYMM(block_timestamp) \
             PRIMARY KEY (id) \
             ORDER BY ({})",
            table, quantity_columns, order_by
        )
    }

    /// Converts `node` into a row aligned to [`Shape::columns`].
    ///
    /// Returns `None` for pending transactions, which have no block yet.
    /// With `skip_json_tags`, tags whose value parses as JSON are dropped.
    pub fn shape(&self, node: &TransactionNode, skip_json_tags: bool) -> Option<Row> {
        let block = node.block.as_ref()?;
        let mut row: Row = vec![
            Value::from(node.id.as_str()),
            Value::from(node.owner.address.as_str()),
            Value::UInt(block.height),
            Value::UInt(block.timestamp),
        ];
        if let Shape::Transfers = self {
            let (winston, ar) = node
                .quantity
                .as_ref()
                .map(|q| (q.winston.parse().unwrap_or(0), q.ar.parse().unwrap_or(0.0)))
                .unwrap_or((0, 0.0));
            row.push(Value::UInt(winston));
            row.push(Value::Float(ar));
        }
        row.push(Value::String(tags_literal(&node.tags, skip_json_tags)));
        Some(row)
    }
}

/// Renders tags as an `Array(Tuple(String, String))` literal.
pub fn tags_literal(tags: &[Tag], skip_json_tags: bool) -> String {
    let tuples: Vec<String> = tags
        .iter()
        .filter(|tag| !(skip_json_tags && is_json(&tag.value)))
        .map(|tag| {
            format!(
                "({}, {})",
                quote_literal(&tag.name),
                quote_literal(&tag.value)
            )
        })
        .collect();
    format!("[{}]", tuples.join(","))
}

fn is_json(value: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(value).is_ok()
}
