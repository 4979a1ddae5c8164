//! Core data types for ingestion.
//!
//! This module defines the fundamental types used throughout the pipeline:
//! column values and their SQL literal form, rows, and stream positions.

use std::fmt;
use std::fmt::Write;

use common::sink::quote_literal;

/// A single column value.
///
/// Values are positionally aligned to a destination's column list. Scalars
/// are formatted as SQL literals; `Array` and `Tuple` nest.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// A string. Strings that already look like an array literal (`[...]`)
    /// are written verbatim; see [`Value::to_sql`].
    String(String),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

/// An ordered sequence of values aligned to a destination's columns.
pub type Row = Vec<Value>;

impl Value {
    /// Formats the value as a literal for a `VALUES` clause.
    ///
    /// There are two formatting paths. A string whose trimmed form starts
    /// with `[` and ends with `]` is a pre-formatted array literal and is
    /// passed through unchanged. Every other value goes through the generic
    /// scalar formatter, which quotes and escapes strings.
    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.write_sql(&mut out);
        out
    }

    fn write_sql(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("NULL"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::UInt(u) => {
                let _ = write!(out, "{}", u);
            }
            Value::Float(f) => write_float(*f, out),
            Value::String(s) if is_array_literal(s) => out.push_str(s),
            Value::String(s) => out.push_str(&quote_literal(s)),
            Value::Array(items) => write_seq(items, '[', ']', out),
            Value::Tuple(items) => write_seq(items, '(', ')', out),
        }
    }
}

/// Returns true if `s` is a pre-formatted array literal.
pub fn is_array_literal(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.starts_with('[') && trimmed.ends_with(']')
}

fn write_float(f: f64, out: &mut String) {
    if f.is_nan() {
        out.push_str("nan");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "inf" } else { "-inf" });
    } else {
        let _ = write!(out, "{}", f);
    }
}

fn write_seq(items: &[Value], open: char, close: char, out: &mut String) {
    out.push(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        item.write_sql(out);
    }
    out.push(close);
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An opaque, monotonically advancing position in a stream.
///
/// Positions are supplied by the remote source's pagination protocol. The
/// empty position is the initial one, used on cold start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Position(String);

impl Position {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    /// The position a stream starts from when it has no checkpoint.
    pub fn initial() -> Self {
        Self::default()
    }

    pub fn is_initial(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Position {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Position {
    fn from(s: String) -> Self {
        Self(s)
    }
}
