//! Backend-neutral values for parameters and fetched rows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Named parameters, keyed without the leading `@`.
pub type Params = BTreeMap<String, SqlValue>;

/// One fetched row, keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// A single SQL value.
///
/// Uuid, decimal and date columns keep their own variants so a fetched value
/// can be bound back with the type the column has.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Decimal(Decimal),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Object or array JSON; excluded from verification comparison.
    pub fn is_structured(&self) -> bool {
        matches!(
            self,
            Self::Json(serde_json::Value::Object(_)) | Self::Json(serde_json::Value::Array(_))
        )
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            Self::Json(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        }
    }

    fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            Self::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => f.write_str(s),
            Self::Timestamp(t) => f.write_str(&iso(t)),
            Self::Date(d) => write!(f, "{}", d),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::Json(v) => match v {
                serde_json::Value::String(s) => f.write_str(s),
                other => write!(f, "{}", other),
            },
        }
    }
}

fn iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Build a [`Params`] map: `params! { "Id" => 5, "Name" => "x" }`.
#[macro_export]
macro_rules! params {
    () => { $crate::Params::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut p = $crate::Params::new();
        $( p.insert(::std::string::String::from($name), $crate::SqlValue::from($value)); )+
        p
    }};
}

/// Outcome of comparing one expected field against the fetched row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCheck {
    Equal,
    Different,
    /// Structured (JSON object/array) value; not compared.
    Unchecked,
}

/// Type-tolerant comparison used by write verification.
///
/// Numbers equal their numeric-string form, timestamps compare as instants
/// (text is parsed as RFC 3339), everything else compares by its textual
/// form. Structured JSON on either side is reported as `Unchecked`.
pub fn compare_values(expected: &SqlValue, actual: &SqlValue) -> FieldCheck {
    let equal = match (expected, actual) {
        (SqlValue::Null, SqlValue::Null) => true,
        (SqlValue::Null, _) | (_, SqlValue::Null) => false,
        (a, b) if a.is_structured() || b.is_structured() => return FieldCheck::Unchecked,
        (SqlValue::Uuid(u), other) | (other, SqlValue::Uuid(u)) => {
            u.to_string().eq_ignore_ascii_case(other.to_string().trim())
        }
        (SqlValue::Decimal(x), SqlValue::Decimal(y)) => x == y,
        (a @ SqlValue::Timestamp(_), b) | (b, a @ SqlValue::Timestamp(_)) => {
            match (a.as_timestamp(), b.as_timestamp()) {
                (Some(x), Some(y)) => iso(&x) == iso(&y),
                _ => false,
            }
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            (Some(x), None) => numeric_text_eq(x, &b.to_string()),
            (None, Some(y)) => numeric_text_eq(y, &a.to_string()),
            (None, None) => a.to_string() == b.to_string(),
        },
    };

    if equal {
        FieldCheck::Equal
    } else {
        FieldCheck::Different
    }
}

fn numeric_text_eq(n: f64, text: &str) -> bool {
    text.trim().parse::<f64>().map(|t| t == n).unwrap_or(false) || n.to_string() == text
}
