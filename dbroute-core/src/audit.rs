//! Append-only audit trail of database operations.
//!
//! One [`OperationRecord`] per repository call. Writing it is best effort:
//! a failing sink is logged and swallowed, never returned to the caller.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapter::{Adapter, Backend};
use crate::config::AuditConfig;
use crate::context;
use crate::error::Result;
use crate::params;
use crate::value::Params;
use crate::verify::VerificationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Ok,
    Error,
}

/// One audit entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub occurred_at: DateTime<Utc>,
    pub backend: Backend,
    /// `select`/`insert`/`update`/`delete`/`unknown`, prefixed with
    /// `transaction:` for statements run inside a transaction
    pub operation: String,
    pub sql_text: String,
    pub params: Params,
    pub affected_rows: Option<u64>,
    pub duration_ms: u64,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub request_id: Option<String>,
    pub status: OperationStatus,
    pub error_message: Option<String>,
    pub verification: Option<VerificationResult>,
    pub source_service: String,
    pub is_verification: bool,
    pub environment: String,
}

/// What the repository knows about a finished call
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub backend: Backend,
    pub operation: String,
    pub sql_text: String,
    pub params: Params,
    pub affected_rows: Option<u64>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub verification: Option<VerificationResult>,
}

/// Where audit records go
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, record: &OperationRecord) -> Result<()>;
}

/// Inserts records into a log table through the primary adapter.
///
/// Goes straight to the adapter, bypassing the repository, so logging is
/// never guarded, verified or itself logged.
pub struct TableAuditSink {
    adapter: Arc<dyn Adapter>,
    insert_sql: String,
}

impl TableAuditSink {
    pub fn new(adapter: Arc<dyn Adapter>, table: &str) -> Self {
        let insert_sql = format!(
            "INSERT INTO {} (occurred_at, database_type, operation, sql_text, params, affected_rows, \
             execution_ms, user_id, endpoint, request_id, status, error_message, \
             verification_status, verification_details, source_service, is_verification, environment) \
             VALUES (@OccurredAt, @DatabaseType, @Operation, @SqlText, @Params, @AffectedRows, \
             @ExecutionMs, @UserId, @Endpoint, @RequestId, @Status, @ErrorMessage, \
             @VerificationStatus, @VerificationDetails, @SourceService, @IsVerification, @Environment)",
            table
        );
        Self { adapter, insert_sql }
    }
}

fn record_params(record: &OperationRecord) -> Params {
    let status = match record.status {
        OperationStatus::Ok => "ok",
        OperationStatus::Error => "error",
    };
    params! {
        "OccurredAt" => record.occurred_at,
        "DatabaseType" => record.backend.as_str(),
        "Operation" => record.operation.clone(),
        "SqlText" => record.sql_text.clone(),
        "Params" => serde_json::to_value(&record.params).unwrap_or_default(),
        "AffectedRows" => record.affected_rows.map(|n| n as i64),
        "ExecutionMs" => record.duration_ms as i64,
        "UserId" => record.user_id.clone(),
        "Endpoint" => record.endpoint.clone(),
        "RequestId" => record.request_id.clone(),
        "Status" => status,
        "ErrorMessage" => record.error_message.clone(),
        "VerificationStatus" => record.verification.as_ref().map(|v| v.status.as_str()),
        "VerificationDetails" => record.verification.as_ref().map(|v| v.details.clone()),
        "SourceService" => record.source_service.clone(),
        "IsVerification" => record.is_verification,
        "Environment" => record.environment.clone(),
    }
}

#[async_trait]
impl AuditSink for TableAuditSink {
    async fn write(&self, record: &OperationRecord) -> Result<()> {
        self.adapter
            .query(&self.insert_sql, &record_params(record))
            .await?;
        Ok(())
    }
}

/// Collects records in memory; for tests and embedding
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<OperationRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OperationRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, record: &OperationRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Fills in context and environment, then writes without ever failing
pub struct AuditLog {
    sink: Option<Arc<dyn AuditSink>>,
    source_service: String,
    environment: String,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, config: &AuditConfig, environment: &str) -> Self {
        Self {
            sink: config.enabled.then_some(sink),
            source_service: config.source_service.clone(),
            environment: environment.to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: None,
            source_service: String::new(),
            environment: String::new(),
        }
    }

    /// Build the record for `outcome` from the current request context.
    pub fn record_for(&self, outcome: OperationOutcome) -> OperationRecord {
        let ctx = context::current().unwrap_or_default();
        let none_if_empty = |s: String| (!s.is_empty()).then_some(s);
        OperationRecord {
            occurred_at: Utc::now(),
            backend: outcome.backend,
            operation: outcome.operation,
            sql_text: outcome.sql_text,
            params: outcome.params,
            affected_rows: outcome.affected_rows,
            duration_ms: outcome.duration_ms,
            user_id: ctx.user_id,
            endpoint: ctx.endpoint,
            request_id: none_if_empty(ctx.request_id),
            status: if outcome.error_message.is_some() {
                OperationStatus::Error
            } else {
                OperationStatus::Ok
            },
            error_message: outcome.error_message,
            verification: outcome.verification,
            source_service: self.source_service.clone(),
            is_verification: false,
            environment: self.environment.clone(),
        }
    }

    pub async fn log(&self, outcome: OperationOutcome) {
        let Some(sink) = &self.sink else {
            return;
        };
        let record = self.record_for(outcome);
        if let Err(e) = sink.write(&record).await {
            tracing::warn!(
                error = %e,
                backend = %record.backend,
                operation = %record.operation,
                duration_ms = record.duration_ms,
                request_id = record.request_id.as_deref().unwrap_or("-"),
                "DB-LOG: failed to write audit entry"
            );
        }
    }
}
