//! Primary adapter - Postgres-compatible service via sqlx
//!
//! Uses a lazily connecting `PgPool`: building the adapter never touches the
//! network, the first query or ping does. `@Name` placeholders become `$n`.

use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode, PgTypeInfo,
};
use sqlx::{Column, Encode, PgPool, Postgres, Row as _, Type, TypeInfo};

use super::{elapsed_ms, Adapter, AdapterTransaction, Backend, InsertResult, PingReport, QueryResult, Timing};
use crate::config::PrimaryTarget;
use crate::error::{DbError, Result};
use crate::sql::params::{to_postgres, Bound};
use crate::value::{Params, Row, SqlValue};

/// Default maximum connections for the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Postgres-backed primary adapter
pub struct PrimaryAdapter {
    /// Pool, or the reason one could not be configured
    pool: std::result::Result<PgPool, String>,
    probe_table: Option<String>,
}

impl PrimaryAdapter {
    /// Build from resolved configuration.
    ///
    /// Unusable connection details do not fail construction; every call then
    /// reports a configuration error and the router treats the backend as down.
    /// Must be called inside a Tokio runtime.
    pub fn from_target(target: &PrimaryTarget) -> Self {
        let pool = connect_options(target).map(|options| {
            PgPoolOptions::new()
                .max_connections(DEFAULT_MAX_CONNECTIONS)
                .connect_lazy_with(options)
        });
        if let Err(reason) = &pool {
            tracing::warn!(%reason, "Primary adapter has no usable connection settings");
        }
        Self {
            pool,
            probe_table: target.probe_table.clone(),
        }
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Ok(pool),
            probe_table: None,
        }
    }

    pub fn pool(&self) -> Result<&PgPool> {
        self.pool.as_ref().map_err(|reason| DbError::configuration(reason.clone()))
    }
}

fn connect_options(target: &PrimaryTarget) -> std::result::Result<PgConnectOptions, String> {
    let options = if !target.connection_string.is_empty() {
        PgConnectOptions::from_str(&target.connection_string)
            .map_err(|e| format!("Invalid Postgres connection string: {}", e))?
    } else if !target.host.is_empty() {
        PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database)
            .username(&target.user)
            .password(&target.password)
    } else {
        return Err("Postgres connection details missing".to_string());
    };

    Ok(if target.ssl {
        options.ssl_mode(PgSslMode::Require)
    } else {
        options
    })
}

/// Statements that produce a result set rather than just a row count.
fn returns_rows(sql: &str) -> bool {
    let lower = sql.trim_start().to_ascii_lowercase();
    ["select", "with", "values", "show", "table"]
        .iter()
        .any(|kw| lower.starts_with(kw))
        || lower.split(|c: char| !c.is_ascii_alphanumeric() && c != '_').any(|w| w == "returning")
}

/// NULL sent with an unspecified parameter type (oid 0), so the server
/// infers it from the column or operator it meets.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_value(query: PgQuery<'_>, value: SqlValue) -> PgQuery<'_> {
    match value {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(b) => query.bind(b),
        SqlValue::Int(i) => query.bind(i),
        SqlValue::Float(f) => query.bind(f),
        SqlValue::Text(s) => query.bind(s),
        SqlValue::Timestamp(t) => query.bind(t),
        SqlValue::Date(d) => query.bind(d),
        SqlValue::Uuid(u) => query.bind(u),
        SqlValue::Decimal(d) => query.bind(d),
        SqlValue::Json(j) => query.bind(sqlx::types::Json(j)),
    }
}

async fn run<'e, E>(executor: E, bound: Bound) -> Result<QueryResult>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let Bound { sql, values } = bound;
    let wants_rows = returns_rows(&sql);
    // A statement prepared with an inferred NULL type must not be cached
    // under the same text as one prepared with concrete types.
    let has_null = values.iter().any(SqlValue::is_null);
    let mut query = sqlx::query(&sql).persistent(!has_null);
    for value in values {
        query = bind_value(query, value);
    }

    if wants_rows {
        let rows = query.fetch_all(executor).await?;
        Ok(QueryResult::from_rows(rows.iter().map(decode_row).collect()))
    } else {
        let done = query.execute(executor).await?;
        Ok(QueryResult {
            rows: Vec::new(),
            row_count: done.rows_affected(),
        })
    }
}

fn decode_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|col| {
            let value = decode_column(row, col.ordinal(), col.type_info().name());
            (col.name().to_string(), value)
        })
        .collect()
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> SqlValue {
    let decoded: std::result::Result<SqlValue, sqlx::Error> = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(SqlValue::from),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .map(|v| v.map(i64::from).into()),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .map(|v| v.map(i64::from).into()),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(SqlValue::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| v.map(f64::from).into()),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(SqlValue::from),
        "NUMERIC" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(idx)
            .map(SqlValue::from),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<Utc>>, _>(idx)
            .map(SqlValue::from),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map(|t| t.and_utc()).into()),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .map(SqlValue::from),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(SqlValue::from),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .map(SqlValue::from),
        _ => row.try_get::<Option<String>, _>(idx).map(SqlValue::from),
    };

    decoded.unwrap_or_else(|e| {
        tracing::debug!(column = idx, type_name, error = %e, "Undecodable column, using null");
        SqlValue::Null
    })
}

#[async_trait]
impl Adapter for PrimaryAdapter {
    fn backend(&self) -> Backend {
        Backend::Primary
    }

    async fn query(&self, sql: &str, params: &Params) -> Result<QueryResult> {
        let bound = to_postgres(sql, params)?;
        run(self.pool()?, bound).await
    }

    async fn insert_and_get_id(
        &self,
        sql: &str,
        params: &Params,
        id_column: &str,
    ) -> Result<InsertResult> {
        let returning_sql = format!(
            "{} RETURNING {}",
            sql.trim_end().trim_end_matches(';'),
            id_column
        );
        let result = self.query(&returning_sql, params).await?;
        let id = result
            .rows
            .first()
            .and_then(|row| row.get(id_column))
            .filter(|v| !v.is_null())
            .cloned();
        Ok(InsertResult {
            id,
            rows: result.rows,
            row_count: result.row_count,
        })
    }

    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>> {
        let tx = self.pool()?.begin().await?;
        Ok(Box::new(PrimaryTransaction { tx }))
    }

    async fn ping(&self) -> Result<PingReport> {
        let start = Instant::now();
        let mut timings = Vec::new();
        let mut steps: Vec<(&'static str, String)> = vec![
            ("select_1", "SELECT 1".to_string()),
            ("select_now", "SELECT NOW() AS now".to_string()),
        ];
        if let Some(table) = &self.probe_table {
            steps.push(("select_count", format!("SELECT COUNT(*)::int AS count FROM {}", table)));
        }

        for (name, sql) in steps {
            let step = Instant::now();
            self.query(&sql, &Params::new()).await?;
            timings.push(Timing {
                name,
                ms: elapsed_ms(step),
            });
        }

        Ok(PingReport {
            latency_ms: elapsed_ms(start),
            timings,
            last_successful_query_time: Utc::now(),
        })
    }
}

struct PrimaryTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl AdapterTransaction for PrimaryTransaction {
    async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        let bound = to_postgres(sql, params)?;
        run(&mut *self.tx, bound).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::{Adapters, MockAdapter};
    use crate::alerts::{Alerter, MemoryAlertSink};
    use crate::audit::{AuditLog, AuditSink, MemoryAuditSink, TableAuditSink};
    use crate::params;
    use crate::repository::{QueryOptions, Repository};
    use crate::router::Router;
    use crate::verify::VerificationStatus;

    fn target() -> PrimaryTarget {
        crate::Config::default().primary
    }

    #[test]
    fn row_returning_statements() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  with x as (select 1) select * from x"));
        assert!(returns_rows("INSERT INTO t (a) VALUES ($1) RETURNING id"));
        assert!(!returns_rows("UPDATE t SET returning_user = $1"));
        assert!(!returns_rows("DELETE FROM t WHERE id = $1"));
    }

    #[test]
    fn missing_details_is_configuration_error() {
        let err = connect_options(&target()).unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn malformed_url_is_rejected() {
        let mut t = target();
        t.connection_string = "not a url".into();
        assert!(connect_options(&t).is_err());
    }

    #[test]
    fn null_is_sent_without_a_declared_type() {
        assert_eq!(<UntypedNull as Type<Postgres>>::type_info().oid(), Some(Oid(0)));
    }

    #[tokio::test]
    async fn unconfigured_adapter_reports_configuration_error() {
        let adapter = PrimaryAdapter::from_target(&target());
        let err = adapter.query("SELECT 1", &Params::new()).await.unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        assert!(adapter.ping().await.is_err());
    }

    // Integration tests require a real database
    // Run with: DATABASE_URL=postgres://... cargo test -p dbroute-core -- --ignored

    #[tokio::test]
    #[ignore = "requires database"]
    async fn repeated_named_parameter_matches_positional_sql() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = PgPool::connect(&url).await.expect("pool creation failed");
        let adapter = PrimaryAdapter::with_pool(pool.clone());

        let sql = "SELECT * FROM (VALUES (5, 5), (5, 6), (7, 7)) AS t(a, b) WHERE a=@X AND b=@X";
        let named = adapter.query(sql, &params! { "X" => 5 }).await.unwrap();

        let positional: Vec<(i32, i32)> = sqlx::query_as(
            "SELECT * FROM (VALUES (5, 5), (5, 6), (7, 7)) AS t(a, b) WHERE a=$1 AND b=$1",
        )
        .bind(5i32)
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(named.rows.len(), positional.len());
        assert_eq!(named.rows[0]["a"], SqlValue::Int(5));
        assert_eq!(named.rows[0]["b"], SqlValue::Int(5));
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn ping_against_live_database() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = PgPool::connect(&url).await.expect("pool creation failed");
        let report = PrimaryAdapter::with_pool(pool).ping().await.unwrap();
        assert_eq!(report.timings.len(), 2);
    }

    /// One connection, so temporary tables stay visible to every call.
    async fn single_connection() -> (PrimaryAdapter, PgPool) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await
            .expect("pool creation failed");
        (PrimaryAdapter::with_pool(pool.clone()), pool)
    }

    fn live_repository(primary: Arc<dyn Adapter>, sink: Arc<dyn AuditSink>) -> Repository {
        let mock: Arc<dyn Adapter> = Arc::new(MockAdapter::new());
        let adapters = Adapters {
            primary,
            legacy: mock.clone(),
            mock,
        };
        let config = crate::Config::from_vars(Vec::<(String, String)>::new());
        let audit = AuditLog::new(sink, &config.audit, "dev");
        let alerter = Alerter::new(Arc::new(MemoryAlertSink::new()), "dev");
        Repository::new(Arc::new(Router::new(config, adapters, alerter)), audit)
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn null_binds_to_typed_columns() {
        let (adapter, _pool) = single_connection().await;
        adapter
            .query(
                "CREATE TEMP TABLE staff_nulls (id serial PRIMARY KEY, manager_id int, meta jsonb, seen_at timestamptz)",
                &Params::new(),
            )
            .await
            .unwrap();

        let inserted = adapter
            .query(
                "INSERT INTO staff_nulls (manager_id, meta, seen_at) VALUES (@Manager, @Meta, @Seen)",
                &params! {
                    "Manager" => None::<i64>,
                    "Meta" => None::<serde_json::Value>,
                    "Seen" => None::<String>,
                },
            )
            .await
            .unwrap();
        assert_eq!(inserted.row_count, 1);

        // Alternate typed and NULL binds of the same statement text.
        let update = "UPDATE staff_nulls SET manager_id = @Manager";
        for value in [SqlValue::Int(4), SqlValue::Null, SqlValue::Int(5), SqlValue::Null] {
            let p = Params::from([("Manager".to_string(), value)]);
            adapter.query(update, &p).await.unwrap();
        }

        let rows = adapter
            .query("SELECT manager_id, meta FROM staff_nulls", &Params::new())
            .await
            .unwrap();
        assert_eq!(rows.rows[0]["manager_id"], SqlValue::Null);
        assert_eq!(rows.rows[0]["meta"], SqlValue::Null);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn int_and_uuid_keys_verify_after_write() {
        let (adapter, _pool) = single_connection().await;
        for ddl in [
            "CREATE TEMP TABLE staff_int (id serial PRIMARY KEY, name text, manager_id int)",
            "CREATE TEMP TABLE staff_uuid (id uuid PRIMARY KEY DEFAULT gen_random_uuid(), name text, budget numeric(10,2))",
        ] {
            adapter.query(ddl, &Params::new()).await.unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::new());
        let repo = live_repository(Arc::new(adapter), audit.clone());

        let int_id = repo
            .insert_and_get_id(
                "INSERT INTO staff_int (name, manager_id) VALUES (@Name, @Manager)",
                &params! { "Name" => "Ada", "Manager" => 3 },
                "id",
                QueryOptions::new(),
            )
            .await
            .unwrap()
            .expect("generated id");
        assert!(matches!(int_id, SqlValue::Int(_)));

        let budget: rust_decimal::Decimal = "1200.50".parse().unwrap();
        let uuid_id = repo
            .insert_and_get_id(
                "INSERT INTO staff_uuid (name, budget) VALUES (@Name, @Budget)",
                &params! { "Name" => "Ada", "Budget" => budget },
                "id",
                QueryOptions::new(),
            )
            .await
            .unwrap()
            .expect("generated id");
        assert!(matches!(uuid_id, SqlValue::Uuid(_)));

        // NULL assignment, looked up by the fetched keys.
        repo.query(
            "UPDATE staff_int SET manager_id = @Manager WHERE id = @Id",
            &params! { "Manager" => None::<i64>, "Id" => int_id },
            QueryOptions::new(),
        )
        .await
        .unwrap();
        repo.query(
            "UPDATE staff_uuid SET name = @Name WHERE id = @Id",
            &params! { "Name" => "Grace", "Id" => uuid_id },
            QueryOptions::new(),
        )
        .await
        .unwrap();

        let verified: Vec<_> = audit
            .records()
            .into_iter()
            .filter_map(|r| r.verification)
            .collect();
        assert_eq!(verified.len(), 4);
        for v in &verified {
            assert_eq!(v.status, VerificationStatus::Ok, "{}", v.details);
        }
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn table_audit_sink_records_reads_and_verified_writes() {
        let (adapter, pool) = single_connection().await;
        for ddl in [
            "CREATE TEMP TABLE db_logs (
                log_id BIGSERIAL PRIMARY KEY,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                database_type TEXT NOT NULL,
                operation TEXT,
                sql_text TEXT,
                params JSONB,
                affected_rows INT,
                execution_ms INT,
                user_id TEXT,
                endpoint TEXT,
                request_id TEXT,
                status TEXT,
                error_message TEXT,
                verification_status TEXT,
                verification_details JSONB,
                source_service TEXT,
                is_verification BOOLEAN NOT NULL DEFAULT FALSE,
                environment TEXT
            )",
            "CREATE TEMP TABLE staff_audit (id serial PRIMARY KEY, name text)",
        ] {
            adapter.query(ddl, &Params::new()).await.unwrap();
        }
        let adapter: Arc<dyn Adapter> = Arc::new(adapter);
        let sink = Arc::new(TableAuditSink::new(adapter.clone(), "db_logs"));
        let repo = live_repository(adapter, sink);

        repo.query("SELECT 1 AS x", &Params::new(), QueryOptions::new())
            .await
            .unwrap();
        repo.insert_and_get_id(
            "INSERT INTO staff_audit (name) VALUES (@Name)",
            &params! { "Name" => "Ada" },
            "id",
            QueryOptions::new(),
        )
        .await
        .unwrap();

        let logged: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT operation, verification_status FROM db_logs ORDER BY log_id",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            logged,
            vec![
                ("select".to_string(), None),
                ("insert".to_string(), Some("ok".to_string())),
            ]
        );
    }
}
