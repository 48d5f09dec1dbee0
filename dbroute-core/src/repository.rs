//! Repository façade - the only entry point callers use.
//!
//! Every call:
//! 1. initializes the router if needed and picks the active adapter
//! 2. refuses writes up front while degraded and read-only
//! 3. runs the statement and times it
//! 4. verifies successful writes against the primary (policy or per-call)
//! 5. appends an audit record, whatever happened
//!
//! Driver errors reach the caller unchanged. Verification and audit never
//! turn a successful statement into a failure.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::json;

use crate::adapter::{elapsed_ms, Adapter, AdapterTransaction, Backend, QueryResult};
use crate::alerts::{AlertKind, AlertPayload};
use crate::audit::{AuditLog, OperationOutcome, TableAuditSink};
use crate::config::Config;
use crate::error::{DbError, Result};
use crate::router::{Router, RouterState};
use crate::sql::{self, shape, Operation, WherePredicate};
use crate::value::{Params, Row, SqlValue};
use crate::verify::{self, VerificationResult, VerifyRequest, VerifyTarget};

/// Per-call overrides. Explicit verification metadata wins over anything
/// inferred from the SQL text.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub operation: Option<Operation>,
    /// Force verification on or off regardless of policy
    pub verify: Option<bool>,
    pub table: Option<String>,
    pub id_column: Option<String>,
    pub id_value: Option<SqlValue>,
    pub lookup: Option<WherePredicate>,
    pub expected: Option<Row>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Look the written row up by `column = value`.
    pub fn id(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.id_column = Some(column.into());
        self.id_value = Some(value.into());
        self
    }

    /// Look the written row up by `column = @param`.
    pub fn lookup(mut self, column: impl Into<String>, param: impl Into<String>) -> Self {
        self.lookup = Some(WherePredicate {
            column: column.into(),
            param: param.into(),
        });
        self
    }

    pub fn expected(mut self, expected: Row) -> Self {
        self.expected = Some(expected);
        self
    }
}

pub struct Repository {
    router: Arc<Router>,
    audit: Arc<AuditLog>,
}

impl Repository {
    pub fn new(router: Arc<Router>, audit: AuditLog) -> Self {
        Self {
            router,
            audit: Arc::new(audit),
        }
    }

    /// Router from `config`, audit records written to the primary's log table.
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: Config) -> Self {
        let router = Arc::new(Router::from_config(config));
        let config = router.config();
        let sink = Arc::new(TableAuditSink::new(router.primary_adapter(), &config.audit.table));
        let audit = AuditLog::new(sink, &config.audit, &config.environment.name);
        Self::new(router, audit)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    async fn active(&self) -> Result<(RouterState, Backend, Arc<dyn Adapter>)> {
        let state = self.router.init(false).await;
        let backend = state.active.ok_or_else(DbError::no_active_backend)?;
        let adapter = self.router.adapter(backend);
        Ok((state, backend, adapter))
    }

    fn guard_write(&self, state: &RouterState, operation: Operation, sql: &str) -> Result<()> {
        if !operation.is_write() || !state.blocks_writes() {
            return Ok(());
        }
        tracing::warn!(operation = operation.as_str(), "Write blocked in degraded read-only mode");
        self.router.alerter().send_critical_alert(AlertPayload::new(
            AlertKind::DbWriteBlocked,
            "Write operation blocked in degraded mode.",
            json!({ "sql": sql, "active": state.active }),
        ));
        Err(DbError::read_only("Write operations"))
    }

    fn should_verify(state: &RouterState, options: &QueryOptions) -> bool {
        options.verify.unwrap_or(state.policy.verify_writes)
    }

    async fn verify(
        &self,
        state: &RouterState,
        written_to: Backend,
        request: VerifyRequest<'_>,
        sql: &str,
    ) -> VerificationResult {
        let operation = request.operation;
        let primary = self.router.primary_adapter();
        let result = verify::verify_write(
            request,
            VerifyTarget {
                primary: primary.as_ref(),
                primary_ok: state.primary_ok(),
                written_to,
            },
        )
        .await;

        if result.is_mismatch() {
            tracing::error!(
                operation = operation.as_str(),
                details = %result.details,
                "Write verification mismatch"
            );
            self.router.alerter().send_critical_alert(AlertPayload::new(
                AlertKind::DbWriteVerificationMismatch,
                "Write verification detected a mismatch.",
                json!({
                    "operation": operation.as_str(),
                    "table": result.details.get("table"),
                    "fields": result.details.get("fields"),
                    "sql": sql,
                }),
            ));
        }
        result
    }

    /// Run `sql` on the active backend and return its rows.
    pub async fn query(&self, sql: &str, params: &Params, options: QueryOptions) -> Result<Vec<Row>> {
        let (state, backend, adapter) = self.active().await?;
        let operation = options
            .operation
            .unwrap_or_else(|| shape::infer_operation(sql));
        self.guard_write(&state, operation, sql)?;

        let start = Instant::now();
        let result = adapter.query(sql, params).await;
        let duration_ms = elapsed_ms(start);

        let verification = match &result {
            Ok(_) if operation.is_write() && Self::should_verify(&state, &options) => {
                let expected = options.expected.clone().or_else(|| match operation {
                    Operation::Update => shape::infer_expected_from_update(sql, params),
                    _ => None,
                });
                let request = VerifyRequest {
                    operation,
                    table: options
                        .table
                        .clone()
                        .or_else(|| shape::infer_table(sql, operation)),
                    params,
                    id_column: options.id_column.clone(),
                    id_value: options.id_value.clone(),
                    lookup: options
                        .lookup
                        .clone()
                        .or_else(|| shape::infer_where_param(sql)),
                    expected,
                };
                Some(self.verify(&state, backend, request, sql).await)
            }
            _ => None,
        };

        self.audit
            .log(OperationOutcome {
                backend,
                operation: operation.as_str().to_string(),
                sql_text: sql.to_string(),
                params: params.clone(),
                affected_rows: result.as_ref().ok().map(|r| r.row_count),
                duration_ms,
                error_message: result.as_ref().err().map(ToString::to_string),
                verification,
            })
            .await;

        result.map(|r| r.rows)
    }

    /// Run an INSERT and return the generated value of `id_column`.
    pub async fn insert_and_get_id(
        &self,
        sql: &str,
        params: &Params,
        id_column: &str,
        options: QueryOptions,
    ) -> Result<Option<SqlValue>> {
        let (state, backend, adapter) = self.active().await?;
        self.guard_write(&state, Operation::Insert, sql)?;

        let start = Instant::now();
        let result = adapter.insert_and_get_id(sql, params, id_column).await;
        let duration_ms = elapsed_ms(start);

        let verification = match &result {
            Ok(inserted) if Self::should_verify(&state, &options) => {
                let request = VerifyRequest {
                    operation: Operation::Insert,
                    table: options
                        .table
                        .clone()
                        .or_else(|| shape::infer_table(sql, Operation::Insert)),
                    params,
                    id_column: Some(
                        options
                            .id_column
                            .clone()
                            .unwrap_or_else(|| id_column.to_string()),
                    ),
                    id_value: inserted.id.clone(),
                    lookup: None,
                    expected: options
                        .expected
                        .clone()
                        .or_else(|| shape::infer_expected_from_insert(sql, params)),
                };
                Some(self.verify(&state, backend, request, sql).await)
            }
            _ => None,
        };

        self.audit
            .log(OperationOutcome {
                backend,
                operation: Operation::Insert.as_str().to_string(),
                sql_text: sql.to_string(),
                params: params.clone(),
                affected_rows: result.as_ref().ok().map(|r| r.row_count),
                duration_ms,
                error_message: result.as_ref().err().map(ToString::to_string),
                verification,
            })
            .await;

        result.map(|r| r.id)
    }

    /// Run `f` inside one transaction on the active backend.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. Statements are
    /// audited as `transaction:<kind>` and never verified.
    ///
    /// ```ignore
    /// let id = repo
    ///     .with_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.query("UPDATE accounts SET balance = balance - @Amt WHERE id = @From", &p).await?;
    ///             tx.query("UPDATE accounts SET balance = balance + @Amt WHERE id = @To", &p).await?;
    ///             Ok(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut TxQuery) -> BoxFuture<'t, Result<T>>,
    {
        let (state, backend, adapter) = self.active().await?;
        if state.blocks_writes() {
            tracing::warn!("Transaction blocked in degraded read-only mode");
            return Err(DbError::read_only("Transactions"));
        }

        let mut tx = TxQuery {
            inner: adapter.begin().await?,
            backend,
            audit: Arc::clone(&self.audit),
        };

        match f(&mut tx).await {
            Ok(value) => {
                tx.inner.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.inner.rollback().await {
                    tracing::error!(
                        backend = %backend,
                        error = %rollback,
                        "Rollback failed after transaction error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Dialect of the active backend.
    pub fn dialect(&self) -> Backend {
        self.router.dialect()
    }

    pub fn sql_limit(&self, count: u64) -> String {
        sql::limit(self.dialect(), count)
    }

    pub fn sql_coalesce<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        sql::coalesce(args)
    }
}

/// Statement runner bound to one open transaction
pub struct TxQuery {
    inner: Box<dyn AdapterTransaction>,
    backend: Backend,
    audit: Arc<AuditLog>,
}

impl TxQuery {
    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        let operation = shape::infer_operation(sql);
        let start = Instant::now();
        let result = self.inner.query(sql, params).await;
        let duration_ms = elapsed_ms(start);

        self.audit
            .log(OperationOutcome {
                backend: self.backend,
                operation: format!("transaction:{}", operation.as_str()),
                sql_text: sql.to_string(),
                params: params.clone(),
                affected_rows: result.as_ref().ok().map(|r| r.row_count),
                duration_ms,
                error_message: result.as_ref().err().map(ToString::to_string),
                verification: None,
            })
            .await;

        result
    }
}
