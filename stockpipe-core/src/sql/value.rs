//! SQL values, declared column types, and literal formatting.
//!
//! A [`SqlValue`] carries its declared type in its variant. Most values travel
//! to the server as bound parameters; [`format_value`] is the literal form used
//! for values that cannot be bound (`NULL`, raw SQL fragments) and for
//! rendering statements into log lines.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// ISO-8601 layout for `DATETIME` literals. Unambiguous under every
/// `SET DATEFORMAT` / language setting.
pub const DATETIME_LITERAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Declared type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int,
    BigInt,
    /// `NVARCHAR(n)`; `None` renders `NVARCHAR(MAX)`.
    NVarChar(Option<u16>),
    DateTime,
    /// Type text emitted verbatim, e.g. `FLOAT` or `DECIMAL(18, 2)`.
    Raw(String),
}

impl DataType {
    pub fn nvarchar(length: u16) -> Self {
        DataType::NVarChar(Some(length))
    }

    /// DDL spelling of the type.
    pub fn sql_name(&self) -> String {
        match self {
            DataType::Int => "INT".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::NVarChar(Some(n)) => format!("NVARCHAR({n})"),
            DataType::NVarChar(None) => "NVARCHAR(MAX)".to_string(),
            DataType::DateTime => "DATETIME".to_string(),
            DataType::Raw(text) => text.clone(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Int(i32),
    BigInt(i64),
    Text(String),
    DateTime(NaiveDateTime),
    /// SQL text inlined as-is (e.g. `GETDATE()`). Never bound.
    Raw(String),
}

impl SqlValue {
    pub fn text(value: impl Into<String>) -> Self {
        SqlValue::Text(value.into())
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        SqlValue::Raw(sql.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Whether this value can travel as a bound parameter.
    pub fn is_bindable(&self) -> bool {
        !matches!(self, SqlValue::Null | SqlValue::Raw(_))
    }

    /// Unquoted literal text of the value.
    pub fn literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::BigInt(v) => v.to_string(),
            SqlValue::Text(s) | SqlValue::Raw(s) => s.clone(),
            SqlValue::DateTime(dt) => dt.format(DATETIME_LITERAL_FORMAT).to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Ordering between two values of compatible types, following SQL
    /// comparison rules: anything compared with `NULL` is unknown (`None`).
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Null, _) | (_, SqlValue::Null) => None,
            (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
            (SqlValue::DateTime(a), SqlValue::DateTime(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => None,
            },
        }
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// Format a value as a T-SQL literal according to its declared type.
///
/// - `NVARCHAR` → `N'...'` with every single quote doubled
/// - `DATETIME` → `CAST('<iso literal>' AS DATETIME)`
/// - `NULL` → `NULL`
/// - everything else → its literal text
pub fn format_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Text(s) => format!("N'{}'", s.replace('\'', "''")),
        SqlValue::DateTime(_) => format!("CAST('{}' AS DATETIME)", value.literal()),
        other => other.literal(),
    }
}

/// Bracket-quote an identifier, doubling any closing bracket.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}
