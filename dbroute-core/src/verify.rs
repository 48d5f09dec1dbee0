//! Post-write verification against the primary backend.
//!
//! After a committed write the row is looked up again and compared with the
//! values the statement meant to store. The result is informational: it is
//! recorded and alerted, never turned into an error for the caller.

use serde::Serialize;
use serde_json::{json, Value};

use crate::adapter::{Adapter, Backend};
use crate::sql::{Operation, WherePredicate};
use crate::value::{compare_values, FieldCheck, Params, Row, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Ok,
    Mismatch,
    /// The lookup itself failed; says nothing about the data
    Failed,
    Skipped,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Mismatch => "mismatch",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub details: Value,
}

impl VerificationResult {
    fn new(status: VerificationStatus, details: Value) -> Self {
        Self { status, details }
    }

    fn skipped(reason: &str) -> Self {
        Self::new(VerificationStatus::Skipped, json!({ "reason": reason }))
    }

    pub fn is_mismatch(&self) -> bool {
        self.status == VerificationStatus::Mismatch
    }
}

/// Everything known about a write that just succeeded
#[derive(Debug, Clone)]
pub struct VerifyRequest<'a> {
    pub operation: Operation,
    pub table: Option<String>,
    pub params: &'a Params,
    pub id_column: Option<String>,
    pub id_value: Option<SqlValue>,
    /// Predicate for updates and deletes
    pub lookup: Option<WherePredicate>,
    pub expected: Option<Row>,
}

/// Where the verification query runs and whether it can be trusted.
pub struct VerifyTarget<'a> {
    pub primary: &'a dyn Adapter,
    pub primary_ok: bool,
    /// Backend the write actually ran on
    pub written_to: Backend,
}

/// Typed keys bind with their own type. A key the caller supplied as text
/// may stand for a uuid or numeric column, so it is matched against the
/// column's text form instead of being bound as TEXT against that type.
fn lookup_sql(table: &str, column: &str, value: &SqlValue) -> String {
    match value {
        SqlValue::Text(_) => format!(
            "SELECT * FROM {} WHERE CAST({} AS TEXT) = @VerifyValue",
            table, column
        ),
        _ => format!("SELECT * FROM {} WHERE {} = @VerifyValue", table, column),
    }
}

/// Re-read the written row and compare it with what was intended.
pub async fn verify_write(request: VerifyRequest<'_>, target: VerifyTarget<'_>) -> VerificationResult {
    if !target.primary_ok {
        return VerificationResult::skipped("primary_unavailable");
    }
    if target.written_to != Backend::Primary {
        return VerificationResult::skipped("active_not_primary");
    }
    let Some(table) = request.table.as_deref() else {
        return VerificationResult::skipped("table_not_inferred");
    };

    let insufficient = || VerificationResult::skipped("insufficient_verification_metadata");
    let (column, value) = match request.operation {
        Operation::Insert => match (&request.id_column, &request.id_value) {
            (Some(column), Some(value)) if !value.is_null() => (column.clone(), value.clone()),
            _ => return insufficient(),
        },
        Operation::Update | Operation::Delete => {
            let Some(lookup) = request.lookup.as_ref() else {
                return insufficient();
            };
            match request.params.get(&lookup.param) {
                Some(value) if !value.is_null() => (lookup.column.clone(), value.clone()),
                _ => return VerificationResult::skipped("where_param_missing"),
            }
        }
        _ => return insufficient(),
    };

    let sql = lookup_sql(table, &column, &value);
    let params = Params::from([("VerifyValue".to_string(), value)]);
    let rows = match target.primary.query(&sql, &params).await {
        Ok(result) => result.rows,
        Err(e) => {
            tracing::warn!(table, error = %e, "Write verification query failed");
            return VerificationResult::new(
                VerificationStatus::Failed,
                json!({ "error": e.to_string() }),
            );
        }
    };
    let row = rows.into_iter().next();

    if request.operation == Operation::Delete {
        return match row {
            Some(_) => VerificationResult::new(
                VerificationStatus::Mismatch,
                json!({ "reason": "row_still_exists", "table": table }),
            ),
            None => VerificationResult::new(
                VerificationStatus::Ok,
                json!({ "reason": "row_deleted", "table": table }),
            ),
        };
    }

    let Some(row) = row else {
        return VerificationResult::new(
            VerificationStatus::Mismatch,
            json!({ "reason": "row_missing", "table": table }),
        );
    };

    let (mismatched, unchecked) = request
        .expected
        .as_ref()
        .map(|expected| compare_row(expected, &row))
        .unwrap_or_default();

    let mut details = if mismatched.is_empty() {
        json!({ "reason": "row_verified", "table": table })
    } else {
        json!({ "reason": "value_mismatch", "table": table, "fields": mismatched })
    };
    if !unchecked.is_empty() {
        details["unchecked_fields"] = json!(unchecked);
    }
    let status = if mismatched.is_empty() {
        VerificationStatus::Ok
    } else {
        VerificationStatus::Mismatch
    };
    VerificationResult::new(status, details)
}

/// Field names that differ, and field names that were not compared.
fn compare_row(expected: &Row, row: &Row) -> (Vec<String>, Vec<String>) {
    let mut mismatched = Vec::new();
    let mut unchecked = Vec::new();
    for (field, want) in expected {
        let got = lookup_column(row, field).unwrap_or(&SqlValue::Null);
        match compare_values(want, got) {
            FieldCheck::Equal => {}
            FieldCheck::Different => mismatched.push(field.clone()),
            FieldCheck::Unchecked => unchecked.push(field.clone()),
        }
    }
    (mismatched, unchecked)
}

// Postgres folds unquoted identifiers to lower case.
fn lookup_column<'r>(row: &'r Row, field: &str) -> Option<&'r SqlValue> {
    row.get(field).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, v)| v)
    })
}
