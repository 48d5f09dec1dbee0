//! Mock adapter - offline/dev stand-in
//!
//! Accepts every statement, stores nothing, returns empty results.

use async_trait::async_trait;
use chrono::Utc;

use super::{Adapter, AdapterTransaction, Backend, InsertResult, PingReport, QueryResult, Timing};
use crate::error::Result;
use crate::value::{Params, SqlValue};

#[derive(Debug, Default)]
pub struct MockAdapter;

impl MockAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn backend(&self) -> Backend {
        Backend::Mock
    }

    async fn query(&self, sql: &str, _params: &Params) -> Result<QueryResult> {
        tracing::warn!(sql, "MockDB query executed");
        Ok(QueryResult::default())
    }

    async fn insert_and_get_id(
        &self,
        sql: &str,
        _params: &Params,
        _id_column: &str,
    ) -> Result<InsertResult> {
        tracing::warn!(sql, "MockDB insert executed");
        Ok(InsertResult {
            id: Some(SqlValue::Int(Utc::now().timestamp_millis())),
            rows: Vec::new(),
            row_count: 1,
        })
    }

    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>> {
        Ok(Box::new(MockTransaction))
    }

    async fn ping(&self) -> Result<PingReport> {
        Ok(PingReport {
            latency_ms: 0,
            timings: vec![Timing { name: "mock", ms: 0 }],
            last_successful_query_time: Utc::now(),
        })
    }
}

struct MockTransaction;

#[async_trait]
impl AdapterTransaction for MockTransaction {
    async fn query(&mut self, sql: &str, _params: &Params) -> Result<QueryResult> {
        tracing::warn!(sql, "MockDB transactional query executed");
        Ok(QueryResult::default())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
