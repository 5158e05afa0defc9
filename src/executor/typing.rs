//! Result typing from the schema catalogue.
//!
//! runops hands back text only. For `SELECT` queries this stage resolves the
//! MySQL type of each projected column and converts values accordingly, so
//! clients can sort numbers as numbers and render dates as dates.

use super::{Column, ColumnValue, QueryExecutor, ResultSet, leading_keyword};
use crate::error::{ProxyError, ProxyResult};
use crate::schema::{DataTypeInfo, ResolvedColumn};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static STRAIGHT_JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bstraight_join\b").expect("valid STRAIGHT_JOIN regex"));

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct TypedExecutor<T> {
    executor: T,
    schema: Option<Arc<DataTypeInfo>>,
    default_schema: Option<String>,
    default_schema_loaded: bool,
}

impl<T> TypedExecutor<T> {
    /// Without a catalogue every query passes straight through.
    pub fn new(executor: T, schema: Option<Arc<DataTypeInfo>>) -> Self {
        Self {
            executor,
            schema,
            default_schema: None,
            default_schema_loaded: false,
        }
    }

    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }
}

impl<T> TypedExecutor<T>
where
    T: QueryExecutor,
{
    async fn load_default_schema(&mut self) -> ProxyResult<()> {
        if self.default_schema_loaded {
            return Ok(());
        }
        debug!("Loading current schema");
        let result = self
            .executor
            .query("select database();")
            .await?
            .ok_or_else(|| ProxyError::type_discovery("select database() returned nothing"))?;
        self.default_schema = result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(ColumnValue::as_str)
            .filter(|schema| !schema.is_empty())
            .map(str::to_string);
        self.default_schema_loaded = true;
        Ok(())
    }

    async fn resolve(
        &mut self,
        schema: &DataTypeInfo,
        query: &str,
    ) -> ProxyResult<Vec<ResolvedColumn>> {
        let parseable = STRAIGHT_JOIN.replace_all(query, "JOIN");
        let statements = Parser::parse_sql(&MySqlDialect {}, &parseable)?;
        self.load_default_schema().await?;
        schema.column_types(self.default_schema.as_deref(), &statements)
    }
}

#[async_trait]
impl<T> QueryExecutor for TypedExecutor<T>
where
    T: QueryExecutor,
{
    async fn query(&mut self, query: &str) -> ProxyResult<Option<ResultSet>> {
        let Some(schema) = self.schema.clone() else {
            return self.executor.query(query).await;
        };

        match leading_keyword(query).as_str() {
            "use" => {
                let result = self.executor.query(query).await?;
                self.default_schema = Some(use_target(query));
                self.default_schema_loaded = true;
                return Ok(result);
            }
            "select" => {}
            _ => return self.executor.query(query).await,
        }

        let columns = match self.resolve(&schema, query).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!(error = %e, "Result will not have types");
                return self.executor.query(query).await;
            }
        };
        debug!(columns = ?columns, "Expected column types");

        let result = self.executor.query(query).await?;
        Ok(apply_types(result, columns))
    }
}

/// Database named by a `USE` statement.
fn use_target(query: &str) -> String {
    let rest = query.trim_start();
    let rest = rest.get(3..).unwrap_or_default();
    rest.trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches('`')
        .to_string()
}

fn apply_types(result: Option<ResultSet>, types: Vec<ResolvedColumn>) -> Option<ResultSet> {
    if types.is_empty() {
        return result;
    }

    // mysql batch mode prints nothing at all for an empty result
    let Some(mut result) = result.filter(ResultSet::has_columns) else {
        let columns = types
            .into_iter()
            .map(|(name, data_type)| Column { name, data_type })
            .collect();
        return Some(ResultSet::new(columns, Vec::new()));
    };

    if result.columns.len() != types.len() {
        warn!(
            expected = types.len(),
            found = result.columns.len(),
            "Wrong number of columns in result, keeping it untyped"
        );
        return Some(result);
    }

    for (column, (_, data_type)) in result.columns.iter_mut().zip(&types) {
        column.data_type = data_type.clone();
    }
    for row in &mut result.rows {
        for (value, (_, data_type)) in row.iter_mut().zip(&types) {
            let taken = std::mem::replace(value, ColumnValue::Null);
            *value = convert_value(taken, data_type.as_deref());
        }
    }
    Some(result)
}

/// Convert a textual value to the representation of its data type.
///
/// Values that do not parse are kept as text.
pub fn convert_value(value: ColumnValue, data_type: Option<&str>) -> ColumnValue {
    let ColumnValue::String(text) = value else {
        return value;
    };
    let converted = match data_type {
        Some("bigint") => text.parse().ok().map(ColumnValue::I64),
        Some("int" | "mediumint") => text.parse().ok().map(ColumnValue::I32),
        Some("smallint" | "year") => text.parse().ok().map(ColumnValue::I16),
        Some("tinyint") => text.parse().ok().map(ColumnValue::I8),
        Some("double") => text.parse().ok().map(ColumnValue::Double),
        Some("float") => text.parse().ok().map(ColumnValue::Float),
        Some("datetime" | "timestamp") => NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT)
            .ok()
            .map(ColumnValue::DateTime),
        Some("date") => NaiveDate::parse_from_str(&text, DATE_FORMAT)
            .ok()
            .map(ColumnValue::Date),
        _ => None,
    };
    converted.unwrap_or(ColumnValue::String(text))
}
