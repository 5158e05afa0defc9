//! Query execution pipeline.
//!
//! Every stage of the pipeline implements [`QueryExecutor`] and wraps the next
//! one:
//! - `cache`: answers cacheable queries from shared storage
//! - `sanitizer`: strips client comments and unsupported variables
//! - `filter`: swallows statements runops cannot answer
//! - `typing`: attaches schema types to result columns
//! - `accumulator`: replays session state (`SET`, `USE`) on every task
//! - `runops`: runs the query through the runops CLI

pub mod accumulator;
pub mod cache;
pub mod filter;
pub mod pipeline;
pub mod runops;
pub mod sanitizer;
pub mod typing;

pub use accumulator::QueryAccumulator;
pub use cache::{InMemoryQueryStorage, QueryCache, QueryStorage};
pub use filter::QueryFilter;
pub use pipeline::{ExecutorFactory, PipelineFactory, RunopsPipeline};
pub use runops::{RunopsClient, RunopsSettings};
pub use sanitizer::QuerySanitizer;
pub use typing::TypedExecutor;

use crate::error::ProxyResult;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tracing::warn;

/// A single value of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    String(String),
    I64(i64),
    I32(i32),
    I16(i16),
    I8(i8),
    Double(f64),
    Float(f32),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl ColumnValue {
    /// Borrow the textual value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A result column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// Lowercase MySQL `DATA_TYPE`, when known.
    pub data_type: Option<String>,
}

impl Column {
    /// Create an untyped column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }

    /// Create a column with a known data type.
    pub fn typed(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type.into()),
        }
    }
}

pub type Row = Vec<ColumnValue>;

/// Fully materialized query result.
///
/// A result without columns means the statement completed without producing
/// rows; the client gets a plain OK for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// A result with no columns and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_columns(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Parse tab-separated output as printed by the mysql client in batch mode.
    ///
    /// The first line holds the column names; every following non-empty line
    /// is a row. The literal `NULL` is a SQL NULL.
    pub fn from_tsv(text: &str) -> Self {
        let mut lines = text.lines();
        let columns: Vec<Column> = match lines.next() {
            Some(header) => header
                .split('\t')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(Column::new)
                .collect(),
            None => Vec::new(),
        };

        if columns.is_empty() {
            return Self::empty();
        }

        let width = columns.len();
        let mut ragged = 0usize;
        let rows = lines
            .filter(|line| !line.is_empty())
            .map(|line| {
                let mut row: Row = line
                    .split('\t')
                    .map(|value| match value {
                        "NULL" => ColumnValue::Null,
                        value => ColumnValue::String(unescape_batch_value(value)),
                    })
                    .collect();
                if row.len() != width {
                    ragged += 1;
                    row.resize(width, ColumnValue::Null);
                }
                row
            })
            .collect();

        if ragged > 0 {
            warn!(
                rows = ragged,
                columns = width,
                "Result rows did not match the header width"
            );
        }

        Self { columns, rows }
    }
}

/// Decode the escapes the mysql client applies in batch mode.
fn unescape_batch_value(value: &str) -> String {
    if !value.contains('\\') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Lowercase first keyword of a statement.
pub(crate) fn leading_keyword(query: &str) -> String {
    query
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Something that can run a SQL query and hand back its result.
///
/// `Ok(None)` means the statement was absorbed by the pipeline and the client
/// should just receive an OK.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>>;
}

#[async_trait]
impl<T> QueryExecutor for Box<T>
where
    T: QueryExecutor + ?Sized,
{
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        (**self).query(query).await
    }
}
