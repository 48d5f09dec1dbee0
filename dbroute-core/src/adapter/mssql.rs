//! Legacy adapter - SQL-Server-compatible service via tiberius
//!
//! Connections live in a lazily filled `bb8` pool, so legacy calls run
//! concurrently and a transaction owns one connection until it finishes.
//! A connection that failed mid-call, or whose transaction was abandoned, is
//! marked broken and closed instead of going back to the pool.
//! `@Name` placeholders are renamed to the driver's `@P1..@Pn` parameters.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection, RunError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{elapsed_ms, Adapter, AdapterTransaction, Backend, InsertResult, PingReport, QueryResult, Timing};
use crate::config::LegacyTarget;
use crate::error::{DbError, Result};
use crate::sql::params::{to_legacy, Bound};
use crate::value::{Params, Row, SqlValue};

/// Default maximum connections for the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// How long a caller waits for a connection before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Helper column carrying `@@ROWCOUNT` back from an insert.
const AFFECTED_COLUMN: &str = "__rows_affected";

type LegacyClient = Client<Compat<TcpStream>>;
type LegacyPool = Pool<LegacyManager>;

/// One pooled driver connection
pub struct LegacyConnection {
    client: LegacyClient,
    /// Set after a failure; the pool drops the connection on return.
    broken: bool,
}

/// Opens tiberius connections for the pool
pub struct LegacyManager {
    config: tiberius::Config,
    host: String,
}

#[async_trait]
impl ManageConnection for LegacyManager {
    type Connection = LegacyConnection;
    type Error = DbError;

    async fn connect(&self) -> Result<LegacyConnection> {
        let tcp = TcpStream::connect(self.config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(self.config.clone(), tcp.compat_write()).await?;
        tracing::info!(host = %self.host, "Connected to legacy database");
        Ok(LegacyConnection {
            client,
            broken: false,
        })
    }

    async fn is_valid(&self, conn: &mut LegacyConnection) -> Result<()> {
        conn.client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut LegacyConnection) -> bool {
        conn.broken
    }
}

/// SQL Server-backed legacy adapter
pub struct LegacyAdapter {
    /// Pool, or the reason one could not be configured
    pool: std::result::Result<LegacyPool, String>,
}

impl LegacyAdapter {
    /// Build from resolved configuration without connecting.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_target(target: &LegacyTarget) -> Self {
        let pool = driver_config(target).map(|config| {
            Pool::builder()
                .max_size(DEFAULT_MAX_CONNECTIONS)
                .connection_timeout(CONNECT_TIMEOUT)
                .retry_connection(false)
                .build_unchecked(LegacyManager {
                    config,
                    host: target.host.clone(),
                })
        });
        if let Err(reason) = &pool {
            tracing::debug!(%reason, "Legacy adapter has no usable connection settings");
        }
        Self { pool }
    }

    async fn connection(&self) -> Result<PooledConnection<'static, LegacyManager>> {
        let pool = self
            .pool
            .as_ref()
            .map_err(|reason| DbError::configuration(reason.clone()))?;
        pool.get_owned().await.map_err(pool_error)
    }
}

fn driver_config(target: &LegacyTarget) -> std::result::Result<tiberius::Config, String> {
    if target.host.is_empty() {
        return Err("Legacy database host missing".to_string());
    }
    let mut config = tiberius::Config::new();
    config.host(&target.host);
    config.port(target.port);
    config.database(&target.database);
    config.authentication(AuthMethod::sql_server(&target.user, &target.password));
    config.encryption(if target.encrypt {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::Off
    });
    if target.trust_cert {
        config.trust_cert();
    }
    Ok(config)
}

fn pool_error(e: RunError<DbError>) -> DbError {
    match e {
        RunError::User(e) => e,
        RunError::TimedOut => {
            DbError::connectivity("legacy", "timed out waiting for a pooled connection")
        }
    }
}

fn build_query(bound: Bound) -> Query<'static> {
    let mut query = Query::new(bound.sql);
    for value in bound.values {
        match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(b),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::Float(f) => query.bind(f),
            SqlValue::Text(s) => query.bind(s),
            SqlValue::Timestamp(t) => query.bind(t),
            SqlValue::Date(d) => query.bind(d),
            SqlValue::Uuid(u) => query.bind(u),
            SqlValue::Decimal(d) => query.bind(tiberius::numeric::Numeric::new_with_scale(d.mantissa(), d.scale() as u8)),
            SqlValue::Json(j) => query.bind(j.to_string()),
        }
    }
    query
}

fn returns_rows(sql: &str) -> bool {
    let lower = sql.trim_start().to_ascii_lowercase();
    lower.starts_with("select") || lower.starts_with("with") || lower.contains(" output ")
}

/// Run one statement, marking the connection broken if the driver fails.
async fn run(conn: &mut LegacyConnection, bound: Bound) -> Result<QueryResult> {
    let outcome = execute(&mut conn.client, bound).await;
    if outcome.is_err() {
        conn.broken = true;
    }
    outcome
}

async fn execute(client: &mut LegacyClient, bound: Bound) -> Result<QueryResult> {
    let wants_rows = returns_rows(&bound.sql);
    let query = build_query(bound);
    if wants_rows {
        let rows = query.query(client).await?.into_first_result().await?;
        Ok(QueryResult::from_rows(rows.into_iter().map(decode_row).collect()))
    } else {
        let done = query.execute(client).await?;
        Ok(QueryResult {
            rows: Vec::new(),
            row_count: done.rows_affected().first().copied().unwrap_or_default(),
        })
    }
}

fn decode_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    names
        .into_iter()
        .zip(row.into_iter().map(decode_column))
        .collect()
}

fn decode_column(data: ColumnData<'static>) -> SqlValue {
    let decoded: std::result::Result<SqlValue, tiberius::error::Error> = match &data {
        ColumnData::U8(v) => Ok(v.map(i64::from).into()),
        ColumnData::I16(v) => Ok(v.map(i64::from).into()),
        ColumnData::I32(v) => Ok(v.map(i64::from).into()),
        ColumnData::I64(v) => Ok((*v).into()),
        ColumnData::F32(v) => Ok(v.map(f64::from).into()),
        ColumnData::F64(v) => Ok((*v).into()),
        ColumnData::Bit(v) => Ok((*v).into()),
        ColumnData::String(v) => Ok(v.as_ref().map(|s| s.to_string()).into()),
        ColumnData::Guid(v) => Ok((*v).into()),
        ColumnData::Numeric(_) => Decimal::from_sql(&data).map(SqlValue::from),
        ColumnData::Xml(v) => Ok(v
            .as_ref()
            .map(|x| x.clone().into_owned().into_string())
            .into()),
        ColumnData::Binary(v) => Ok(v
            .as_ref()
            .map(|b| b.iter().map(|byte| format!("{:02x}", byte)).collect::<String>())
            .into()),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(&data).map(SqlValue::from)
        }
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(&data).map(|v| v.map(|t| t.and_utc()).into())
        }
        ColumnData::Date(_) => NaiveDate::from_sql(&data).map(SqlValue::from),
        ColumnData::Time(_) => {
            NaiveTime::from_sql(&data).map(|v| v.map(|t| t.to_string()).into())
        }
        #[allow(unreachable_patterns)]
        _ => Ok(SqlValue::Null),
    };

    decoded.unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Undecodable legacy column, using null");
        SqlValue::Null
    })
}

fn first_value(rows: &[Row], column: &str) -> Option<SqlValue> {
    rows.iter()
        .rev()
        .find_map(|row| row.get(column))
        .filter(|v| !v.is_null())
        .cloned()
}

/// Take the `@@ROWCOUNT` helper column out of the identity row.
fn split_affected(mut rows: Vec<Row>) -> (Vec<Row>, u64) {
    let affected = rows
        .last_mut()
        .and_then(|row| row.remove(AFFECTED_COLUMN))
        .and_then(|v| match v {
            SqlValue::Int(n) => u64::try_from(n).ok(),
            _ => None,
        })
        .unwrap_or_default();
    (rows, affected)
}

#[async_trait]
impl Adapter for LegacyAdapter {
    fn backend(&self) -> Backend {
        Backend::Legacy
    }

    async fn query(&self, sql: &str, params: &Params) -> Result<QueryResult> {
        let bound = to_legacy(sql, params)?;
        let mut conn = self.connection().await?;
        run(&mut conn, bound).await
    }

    async fn insert_and_get_id(
        &self,
        sql: &str,
        params: &Params,
        id_column: &str,
    ) -> Result<InsertResult> {
        // Same batch: the insert, then its row count and generated identity.
        let combined = format!(
            "{}; SELECT @@ROWCOUNT AS {}, CAST(SCOPE_IDENTITY() AS BIGINT) AS {}",
            sql.trim_end().trim_end_matches(';'),
            AFFECTED_COLUMN,
            id_column
        );
        let bound = to_legacy(&combined, params)?;
        let mut conn = self.connection().await?;

        let query = build_query(bound);
        let outcome = async {
            let sets = query.query(&mut conn.client).await?.into_results().await?;
            Ok::<_, DbError>(sets.into_iter().flatten().map(decode_row).collect::<Vec<_>>())
        }
        .await;

        let rows = match outcome {
            Ok(rows) => rows,
            Err(e) => {
                conn.broken = true;
                return Err(e);
            }
        };
        let (rows, row_count) = split_affected(rows);
        Ok(InsertResult {
            id: first_value(&rows, id_column),
            rows,
            row_count,
        })
    }

    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>> {
        let mut conn = self.connection().await?;
        let started = async {
            conn.client
                .simple_query("BEGIN TRANSACTION")
                .await?
                .into_results()
                .await?;
            Ok::<_, DbError>(())
        }
        .await;
        if let Err(e) = started {
            conn.broken = true;
            return Err(e);
        }
        Ok(Box::new(LegacyTransaction {
            conn,
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<PingReport> {
        let start = Instant::now();
        self.query("SELECT 1 AS ok", &Params::new()).await?;
        let ms = elapsed_ms(start);
        Ok(PingReport {
            latency_ms: ms,
            timings: vec![Timing { name: "select_1", ms }],
            last_successful_query_time: Utc::now(),
        })
    }
}

/// Owns one pooled connection from `BEGIN` to `COMMIT`/`ROLLBACK`.
struct LegacyTransaction {
    conn: PooledConnection<'static, LegacyManager>,
    finished: bool,
}

impl LegacyTransaction {
    async fn finish(mut self, statement: &str) -> Result<()> {
        let outcome = async {
            self.conn
                .client
                .simple_query(statement)
                .await?
                .into_results()
                .await?;
            Ok::<_, DbError>(())
        }
        .await;
        if outcome.is_err() {
            self.conn.broken = true;
        }
        self.finished = true;
        outcome
    }
}

impl Drop for LegacyTransaction {
    fn drop(&mut self) {
        if !self.finished {
            // Closing the connection makes the server roll back.
            self.conn.broken = true;
            tracing::warn!("Legacy transaction dropped before commit or rollback; discarding connection");
        }
    }
}

#[async_trait]
impl AdapterTransaction for LegacyTransaction {
    async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult> {
        let bound = to_legacy(sql, params)?;
        run(&mut self.conn, bound).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT TRANSACTION").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK TRANSACTION").await
    }
}
