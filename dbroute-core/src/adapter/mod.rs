//! Backend adapters - one uniform surface per database
//!
//! Every adapter exposes the same capability set:
//! - `query` / `insert_and_get_id` against its pool
//! - `begin` for a transaction handle with its own scoped `query`
//! - `ping` for connectivity checks
//!
//! Callers always write `@Name` placeholders; each adapter translates them
//! for its driver (see [`crate::sql::params`]).

pub mod mock;
pub mod mssql;
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::value::{Params, Row, SqlValue};

pub use mock::MockAdapter;
pub use mssql::LegacyAdapter;
pub use postgres::PrimaryAdapter;

/// Which backend an adapter talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Elastic Postgres-compatible service
    Primary,
    /// SQL-Server-compatible service
    Legacy,
    /// Offline stand-in; accepts everything, stores nothing
    Mock,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Legacy => "legacy",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rows plus affected-row count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }
}

/// Result of an insert that reports its generated key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResult {
    pub id: Option<SqlValue>,
    pub rows: Vec<Row>,
    pub row_count: u64,
}

/// Single named step of a ping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timing {
    pub name: &'static str,
    pub ms: u64,
}

/// Successful ping measurements
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingReport {
    pub latency_ms: u64,
    pub timings: Vec<Timing>,
    pub last_successful_query_time: DateTime<Utc>,
}

/// Uniform backend surface
#[async_trait]
pub trait Adapter: Send + Sync {
    fn backend(&self) -> Backend;

    async fn query(&self, sql: &str, params: &Params) -> Result<QueryResult>;

    /// Run an INSERT and return the generated value of `id_column`.
    async fn insert_and_get_id(
        &self,
        sql: &str,
        params: &Params,
        id_column: &str,
    ) -> Result<InsertResult>;

    /// Open a transaction. The handle must be finished with `commit` or `rollback`.
    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>>;

    async fn ping(&self) -> Result<PingReport>;
}

/// Open transaction on one backend connection
#[async_trait]
pub trait AdapterTransaction: Send {
    async fn query(&mut self, sql: &str, params: &Params) -> Result<QueryResult>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The three adapters the router chooses between
#[derive(Clone)]
pub struct Adapters {
    pub primary: Arc<dyn Adapter>,
    pub legacy: Arc<dyn Adapter>,
    pub mock: Arc<dyn Adapter>,
}

impl Adapters {
    /// Real adapters built from configuration. Nothing connects until first use.
    pub fn from_config(config: &crate::Config) -> Self {
        Self {
            primary: Arc::new(PrimaryAdapter::from_target(&config.primary)),
            legacy: Arc::new(LegacyAdapter::from_target(&config.legacy)),
            mock: Arc::new(MockAdapter::new()),
        }
    }

    pub fn get(&self, backend: Backend) -> &Arc<dyn Adapter> {
        match backend {
            Backend::Primary => &self.primary,
            Backend::Legacy => &self.legacy,
            Backend::Mock => &self.mock,
        }
    }
}

/// Milliseconds elapsed since `start`.
pub(crate) fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
