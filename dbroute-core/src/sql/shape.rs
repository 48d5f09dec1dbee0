//! Best-effort SQL shape inference for write verification.
//!
//! Regex heuristics, not a parser. Handles single-table
//! `INSERT INTO t (cols) VALUES (@a, ...)`, `UPDATE t SET c = @p ... WHERE k = @k`
//! and `DELETE FROM t WHERE k = @k`. Joins, CTEs, multi-table writes and
//! computed expressions yield `None`, which makes verification skip instead
//! of reporting a false mismatch. Callers that need precision pass explicit
//! metadata through `QueryOptions`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::value::{Params, Row};

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static INSERT_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^insert\s+into\s+([a-zA-Z0-9_."]+)"#).expect("insert regex"));
static UPDATE_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^update\s+([a-zA-Z0-9_."]+)\s+set\s"#).expect("update regex"));
static DELETE_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)^delete\s+from\s+([a-zA-Z0-9_."]+)"#).expect("delete regex"));
static WHERE_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\swhere\s+([a-zA-Z0-9_."]+)\s*=\s*@([a-zA-Z0-9_]+)"#).expect("where regex")
});
static INSERT_COLUMNS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^insert\s+into\s+[a-zA-Z0-9_."]+\s*\(([^)]+)\)\s*values\s*\(([^)]+)\)"#)
        .expect("insert columns regex")
});
static UPDATE_SET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\sset\s+(.+?)\s+where\s").expect("update set regex"));
static PARAM_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@([a-zA-Z0-9_]+)$").expect("param token regex"));
static JOIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s(join|from)\s").expect("join regex"));

/// Statement kind, inferred from the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Unknown,
}

impl Operation {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Unknown => "unknown",
        }
    }
}

/// Single-column equality predicate used to re-find a written row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WherePredicate {
    pub column: String,
    /// Parameter name (without `@`) holding the lookup value
    pub param: String,
}

/// Collapse whitespace and trim.
pub fn normalize(sql: &str) -> String {
    WHITESPACE_RE.replace_all(sql.trim(), " ").into_owned()
}

pub fn infer_operation(sql: &str) -> Operation {
    let normalized = normalize(sql);
    let first = normalized
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match first.as_str() {
        "select" => Operation::Select,
        "insert" => Operation::Insert,
        "update" => Operation::Update,
        "delete" => Operation::Delete,
        _ => Operation::Unknown,
    }
}

/// Target table of a single-table write.
pub fn infer_table(sql: &str, operation: Operation) -> Option<String> {
    let normalized = normalize(sql);
    let re = match operation {
        Operation::Insert => &*INSERT_TABLE_RE,
        Operation::Update => &*UPDATE_TABLE_RE,
        Operation::Delete => &*DELETE_TABLE_RE,
        _ => return None,
    };
    // UPDATE ... FROM / JOIN touches more than one table.
    if operation == Operation::Update && JOIN_RE.is_match(&normalized) {
        return None;
    }
    re.captures(&normalized)
        .map(|c| unquote(&c[1]))
}

/// `WHERE column = @Param`, first occurrence only.
pub fn infer_where_param(sql: &str) -> Option<WherePredicate> {
    let normalized = normalize(sql);
    WHERE_PARAM_RE.captures(&normalized).map(|c| WherePredicate {
        column: unquote(&c[1]),
        param: c[2].to_string(),
    })
}

/// Expected column values from `INSERT INTO t (a, b) VALUES (@A, @B)`.
///
/// Only columns bound to a bare `@Param` that is present in `params`
/// contribute; literals and expressions are ignored.
pub fn infer_expected_from_insert(sql: &str, params: &Params) -> Option<Row> {
    let normalized = normalize(sql);
    let caps = INSERT_COLUMNS_RE.captures(&normalized)?;
    let columns: Vec<String> = caps[1].split(',').map(unquote).collect();
    let values: Vec<&str> = caps[2].split(',').map(str::trim).collect();
    if columns.len() != values.len() {
        return None;
    }
    let expected: Row = columns
        .into_iter()
        .zip(values)
        .filter_map(|(column, token)| bound_value(token, params).map(|v| (column, v)))
        .collect();
    (!expected.is_empty()).then_some(expected)
}

/// Expected column values from `UPDATE t SET a = @A, b = @B WHERE ...`.
pub fn infer_expected_from_update(sql: &str, params: &Params) -> Option<Row> {
    let normalized = normalize(sql);
    let caps = UPDATE_SET_RE.captures(&normalized)?;
    let expected: Row = caps[1]
        .split(',')
        .filter_map(|assignment| {
            let mut parts = assignment.split('=');
            let column = parts.next()?;
            let token = parts.next()?;
            if parts.next().is_some() {
                return None;
            }
            bound_value(token.trim(), params).map(|v| (unquote(column), v))
        })
        .collect();
    (!expected.is_empty()).then_some(expected)
}

fn bound_value(token: &str, params: &Params) -> Option<crate::SqlValue> {
    let caps = PARAM_TOKEN_RE.captures(token)?;
    params.get(&caps[1]).cloned()
}

fn unquote(ident: &str) -> String {
    ident.trim().replace('"', "")
}
