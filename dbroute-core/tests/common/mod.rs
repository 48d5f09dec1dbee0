//! Shared fixtures: a scriptable spy adapter and a fully wired repository.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use dbroute_core::adapter::{PingReport, Timing};
use dbroute_core::alerts::{Alerter, MemoryAlertSink};
use dbroute_core::audit::{AuditLog, MemoryAuditSink};
use dbroute_core::{
    Adapter, AdapterTransaction, Adapters, Backend, Config, DbError, InsertResult, Params,
    QueryResult, Repository, Result, Router, Row, SqlValue,
};

pub enum Ping {
    Healthy,
    Fails(&'static str),
    Panics,
}

/// Adapter that records every call and answers from a scripted row.
pub struct SpyAdapter {
    backend: Backend,
    ping: Ping,
    ping_delay: Duration,
    pings: AtomicUsize,
    calls: AtomicUsize,
    fail_reads: AtomicBool,
    stored_row: Mutex<Option<Row>>,
    executed: Mutex<Vec<String>>,
    next_id: i64,
}

impl SpyAdapter {
    pub fn new(backend: Backend, ping: Ping) -> Self {
        Self {
            backend,
            ping,
            ping_delay: Duration::ZERO,
            pings: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            stored_row: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            next_id: 7,
        }
    }

    pub fn healthy(backend: Backend) -> Self {
        Self::new(backend, Ping::Healthy)
    }

    pub fn down(backend: Backend) -> Self {
        Self::new(backend, Ping::Fails("connection refused"))
    }

    pub fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    /// Row returned by every SELECT from now on.
    pub fn store_row(&self, row: Row) {
        *self.stored_row.lock().unwrap() = Some(row);
    }

    pub fn clear_row(&self) {
        *self.stored_row.lock().unwrap() = None;
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// query / insert / begin invocations
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn record(&self, sql: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());
    }

    fn answer(&self, sql: &str) -> Result<QueryResult> {
        if sql.trim_start().to_ascii_lowercase().starts_with("select") {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(DbError::connectivity(self.backend.as_str(), "read timed out"));
            }
            let rows = self.stored_row.lock().unwrap().clone().into_iter().collect();
            return Ok(QueryResult::from_rows(rows));
        }
        Ok(QueryResult {
            rows: Vec::new(),
            row_count: 1,
        })
    }
}

#[async_trait]
impl Adapter for SpyAdapter {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn query(&self, sql: &str, _params: &Params) -> Result<QueryResult> {
        self.record(sql);
        self.answer(sql)
    }

    async fn insert_and_get_id(
        &self,
        sql: &str,
        _params: &Params,
        _id_column: &str,
    ) -> Result<InsertResult> {
        self.record(sql);
        Ok(InsertResult {
            id: Some(SqlValue::Int(self.next_id)),
            rows: Vec::new(),
            row_count: 1,
        })
    }

    async fn begin(&self) -> Result<Box<dyn AdapterTransaction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SpyTransaction))
    }

    async fn ping(&self) -> Result<PingReport> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if !self.ping_delay.is_zero() {
            tokio::time::sleep(self.ping_delay).await;
        }
        match self.ping {
            Ping::Healthy => Ok(PingReport {
                latency_ms: 1,
                timings: vec![Timing { name: "select_1", ms: 1 }],
                last_successful_query_time: Utc::now(),
            }),
            Ping::Fails(reason) => Err(DbError::connectivity(self.backend.as_str(), reason)),
            Ping::Panics => panic!("driver exploded"),
        }
    }
}

struct SpyTransaction;

#[async_trait]
impl AdapterTransaction for SpyTransaction {
    async fn query(&mut self, _sql: &str, _params: &Params) -> Result<QueryResult> {
        Ok(QueryResult {
            rows: Vec::new(),
            row_count: 1,
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Repository over spy adapters with in-memory alert and audit sinks
pub struct Harness {
    pub primary: Arc<SpyAdapter>,
    pub legacy: Arc<SpyAdapter>,
    pub mock: Arc<SpyAdapter>,
    pub alerts: Arc<MemoryAlertSink>,
    pub audit: Arc<MemoryAuditSink>,
    pub router: Arc<Router>,
    pub repo: Repository,
}

impl Harness {
    pub fn new(primary: SpyAdapter, legacy: SpyAdapter, vars: &[(&str, &str)]) -> Self {
        let primary = Arc::new(primary);
        let legacy = Arc::new(legacy);
        let mock = Arc::new(SpyAdapter::healthy(Backend::Mock));
        let adapters = Adapters {
            primary: primary.clone(),
            legacy: legacy.clone(),
            mock: mock.clone(),
        };

        let config = Config::from_vars(vars.iter().copied());
        let alerts = Arc::new(MemoryAlertSink::new());
        let alerter = Alerter::new(alerts.clone(), config.environment.name.clone());
        let audit = Arc::new(MemoryAuditSink::new());
        let audit_log = AuditLog::new(audit.clone(), &config.audit, &config.environment.name);
        let router = Arc::new(Router::new(config, adapters, alerter));
        let repo = Repository::new(router.clone(), audit_log);

        Self {
            primary,
            legacy,
            mock,
            alerts,
            audit,
            router,
            repo,
        }
    }

    /// Total data-path calls across all three adapters
    pub fn adapter_calls(&self) -> usize {
        self.primary.calls() + self.legacy.calls() + self.mock.calls()
    }
}
