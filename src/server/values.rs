//! Conversions between pipeline values and the MySQL wire protocol.

use crate::error::{ProxyError, ProxyResult};
use crate::executor::{ColumnValue, ResultSet};
use opensrv_mysql::{Column, ColumnFlags, ColumnType, ToMysqlValue, ValueInner};
use std::io::{self, Write};

const DATETIME_TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_TEXT_FORMAT: &str = "%Y-%m-%d";

/// MySQL column type for a lowercase `DATA_TYPE`.
pub fn column_type(data_type: Option<&str>) -> ColumnType {
    match data_type {
        Some("bigint") => ColumnType::MYSQL_TYPE_LONGLONG,
        Some("varchar") => ColumnType::MYSQL_TYPE_VAR_STRING,
        Some("tinyint") => ColumnType::MYSQL_TYPE_TINY,
        Some("datetime") => ColumnType::MYSQL_TYPE_DATETIME,
        Some("int" | "mediumint") => ColumnType::MYSQL_TYPE_LONG,
        Some("smallint") => ColumnType::MYSQL_TYPE_SHORT,
        Some("text" | "char" | "tinytext" | "mediumtext" | "longtext") => {
            ColumnType::MYSQL_TYPE_STRING
        }
        Some("enum") => ColumnType::MYSQL_TYPE_ENUM,
        Some("decimal") => ColumnType::MYSQL_TYPE_NEWDECIMAL,
        Some("date") => ColumnType::MYSQL_TYPE_DATE,
        Some("binary" | "varbinary" | "blob") => ColumnType::MYSQL_TYPE_BLOB,
        Some("mediumblob") => ColumnType::MYSQL_TYPE_MEDIUM_BLOB,
        Some("double") => ColumnType::MYSQL_TYPE_DOUBLE,
        Some("float") => ColumnType::MYSQL_TYPE_FLOAT,
        Some("time") => ColumnType::MYSQL_TYPE_TIME,
        Some("timestamp") => ColumnType::MYSQL_TYPE_TIMESTAMP,
        Some("year") => ColumnType::MYSQL_TYPE_YEAR,
        Some("bit") => ColumnType::MYSQL_TYPE_BIT,
        _ => ColumnType::MYSQL_TYPE_STRING,
    }
}

/// Column types whose binary encoding is a length-encoded string.
fn is_string_encoded(coltype: ColumnType) -> bool {
    matches!(
        coltype,
        ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_ENUM
            | ColumnType::MYSQL_TYPE_DECIMAL
            | ColumnType::MYSQL_TYPE_NEWDECIMAL
            | ColumnType::MYSQL_TYPE_BIT
    )
}

/// Column definitions for a result.
///
/// The binary protocol encodes values by column type, so for prepared
/// statements a column still holding text where the type expects something
/// else is downgraded to a string column, and its values rendered as text.
pub fn result_columns(result: &mut ResultSet, binary: bool) -> Vec<Column> {
    let mut columns: Vec<Column> = result
        .columns
        .iter()
        .map(|column| Column {
            table: String::new(),
            column: column.name.clone(),
            coltype: column_type(column.data_type.as_deref()),
            colflags: ColumnFlags::empty(),
        })
        .collect();

    if !binary {
        return columns;
    }

    for (index, column) in columns.iter_mut().enumerate() {
        if is_string_encoded(column.coltype) {
            continue;
        }
        let has_text = result
            .rows
            .iter()
            .any(|row| matches!(row.get(index), Some(ColumnValue::String(_))));
        if !has_text {
            continue;
        }
        column.coltype = ColumnType::MYSQL_TYPE_VAR_STRING;
        for row in &mut result.rows {
            if let Some(value) = row.get_mut(index) {
                if let Some(text) = value_text(value) {
                    *value = ColumnValue::String(text);
                }
            }
        }
    }
    columns
}

/// Textual form of a value, as the mysql client would print it.
pub fn value_text(value: &ColumnValue) -> Option<String> {
    Some(match value {
        ColumnValue::Null => return None,
        ColumnValue::String(value) => value.clone(),
        ColumnValue::I64(value) => value.to_string(),
        ColumnValue::I32(value) => value.to_string(),
        ColumnValue::I16(value) => value.to_string(),
        ColumnValue::I8(value) => value.to_string(),
        ColumnValue::Double(value) => value.to_string(),
        ColumnValue::Float(value) => value.to_string(),
        ColumnValue::DateTime(value) => value.format(DATETIME_TEXT_FORMAT).to_string(),
        ColumnValue::Date(value) => value.format(DATE_TEXT_FORMAT).to_string(),
    })
}

impl ToMysqlValue for ColumnValue {
    fn to_mysql_text<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Self::Null => None::<i64>.to_mysql_text(w),
            Self::String(value) => value.to_mysql_text(w),
            Self::I64(value) => value.to_mysql_text(w),
            Self::I32(value) => value.to_mysql_text(w),
            Self::I16(value) => value.to_mysql_text(w),
            Self::I8(value) => value.to_mysql_text(w),
            Self::Double(value) => value.to_mysql_text(w),
            Self::Float(value) => value.to_mysql_text(w),
            Self::DateTime(value) => value.to_mysql_text(w),
            Self::Date(value) => value.to_mysql_text(w),
        }
    }

    fn to_mysql_bin<W: Write>(&self, w: &mut W, c: &Column) -> io::Result<()> {
        match self {
            Self::Null => None::<i64>.to_mysql_bin(w, c),
            Self::String(value) => value.to_mysql_bin(w, c),
            Self::I64(value) => value.to_mysql_bin(w, c),
            Self::I32(value) => value.to_mysql_bin(w, c),
            Self::I16(value) => value.to_mysql_bin(w, c),
            Self::I8(value) => value.to_mysql_bin(w, c),
            Self::Double(value) => value.to_mysql_bin(w, c),
            Self::Float(value) => value.to_mysql_bin(w, c),
            Self::DateTime(value) => value.to_mysql_bin(w, c),
            Self::Date(value) => value.to_mysql_bin(w, c),
        }
    }

    fn is_null(&self) -> bool {
        ColumnValue::is_null(self)
    }
}

/// Byte offsets of `?` placeholders outside quoted strings and identifiers.
fn placeholder_positions(query: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = query.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && q != '`' {
                    chars.next();
                } else if c == q {
                    // A doubled quote is an escaped quote.
                    if chars.peek().is_some_and(|&(_, next)| next == q) {
                        chars.next();
                    } else {
                        quote = None;
                    }
                }
            }
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '?' => positions.push(index),
                _ => {}
            },
        }
    }
    positions
}

pub fn count_placeholders(query: &str) -> usize {
    placeholder_positions(query).len()
}

/// Substitute rendered literals for the placeholders, in order.
pub fn bind_placeholders(query: &str, literals: &[String]) -> ProxyResult<String> {
    let positions = placeholder_positions(query);
    if positions.len() != literals.len() {
        return Err(ProxyError::invalid_input(format!(
            "statement expects {} parameters, got {}",
            positions.len(),
            literals.len()
        )));
    }

    let extra: usize = literals.iter().map(String::len).sum();
    let mut bound = String::with_capacity(query.len() + extra);
    let mut last = 0;
    for (position, literal) in positions.into_iter().zip(literals) {
        bound.push_str(&query[last..position]);
        bound.push_str(literal);
        last = position + 1;
    }
    bound.push_str(&query[last..]);
    Ok(bound)
}

/// Render a bound statement parameter as a SQL literal.
pub fn param_literal(value: ValueInner<'_>) -> ProxyResult<String> {
    match value {
        ValueInner::NULL => Ok("NULL".to_string()),
        ValueInner::Int(value) => Ok(value.to_string()),
        ValueInner::UInt(value) => Ok(value.to_string()),
        ValueInner::Double(value) if value.is_finite() => Ok(value.to_string()),
        ValueInner::Double(value) => Err(ProxyError::invalid_input(format!(
            "cannot bind non-finite number {}",
            value
        ))),
        ValueInner::Bytes(bytes) => Ok(match std::str::from_utf8(bytes) {
            Ok(text) => quote_string(text),
            Err(_) => hex_literal(bytes),
        }),
        ValueInner::Date(bytes) => binary_date(bytes).map(|date| format!("'{}'", date)),
        ValueInner::Datetime(bytes) => binary_datetime(bytes).map(|dt| format!("'{}'", dt)),
        ValueInner::Time(bytes) => binary_time(bytes).map(|time| format!("'{}'", time)),
    }
}

/// Quote a string literal with MySQL escapes.
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\0' => quoted.push_str("\\0"),
            '\'' => quoted.push_str("\\'"),
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\u{1a}' => quoted.push_str("\\Z"),
            c => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut literal = String::with_capacity(bytes.len() * 2 + 3);
    literal.push_str("X'");
    for byte in bytes {
        literal.push_str(&format!("{:02X}", byte));
    }
    literal.push('\'');
    literal
}

fn invalid_temporal(kind: &str, bytes: &[u8]) -> ProxyError {
    ProxyError::invalid_input(format!(
        "malformed binary {} parameter ({} bytes)",
        kind,
        bytes.len()
    ))
}

/// `[year u16][month][day]`
fn binary_date(bytes: &[u8]) -> ProxyResult<String> {
    match bytes {
        [] => Ok("0000-00-00".to_string()),
        [y0, y1, month, day, ..] => Ok(format!(
            "{:04}-{:02}-{:02}",
            u16::from_le_bytes([*y0, *y1]),
            month,
            day
        )),
        _ => Err(invalid_temporal("date", bytes)),
    }
}

/// `[date][hour][minute][second][micros u32]`, trailing parts optional.
fn binary_datetime(bytes: &[u8]) -> ProxyResult<String> {
    match bytes.len() {
        0 => Ok("0000-00-00 00:00:00".to_string()),
        4 => Ok(format!("{} 00:00:00", binary_date(bytes)?)),
        7 | 11 => {
            let mut text = format!(
                "{} {:02}:{:02}:{:02}",
                binary_date(&bytes[..4])?,
                bytes[4],
                bytes[5],
                bytes[6]
            );
            if bytes.len() == 11 {
                let micros = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
                text.push_str(&format!(".{:06}", micros));
            }
            Ok(text)
        }
        _ => Err(invalid_temporal("datetime", bytes)),
    }
}

/// `[negative][days u32][hour][minute][second][micros u32]`
fn binary_time(bytes: &[u8]) -> ProxyResult<String> {
    match bytes.len() {
        0 => Ok("00:00:00".to_string()),
        8 | 12 => {
            let sign = if bytes[0] == 1 { "-" } else { "" };
            let days = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            let hours = u64::from(days) * 24 + u64::from(bytes[5]);
            let mut text = format!("{}{:02}:{:02}:{:02}", sign, hours, bytes[6], bytes[7]);
            if bytes.len() == 12 {
                let micros = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
                text.push_str(&format!(".{:06}", micros));
            }
            Ok(text)
        }
        _ => Err(invalid_temporal("time", bytes)),
    }
}
