//! dbroute-core - multi-backend database routing
//!
//! Picks one active backend out of a Postgres-compatible primary, a SQL
//! Server legacy database and an offline mock, guards writes while degraded,
//! verifies writes against the primary and keeps an audit trail of every call.

pub mod adapter;
pub mod alerts;
pub mod audit;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod global;
pub mod health;
pub mod repository;
pub mod router;
pub mod sql;
pub mod value;
pub mod verify;

pub use adapter::{Adapter, AdapterTransaction, Adapters, Backend, InsertResult, QueryResult};
pub use config::Config;
pub use context::RequestContext;
pub use error::{DbError, Result};
pub use repository::{QueryOptions, Repository, TxQuery};
pub use router::{DiagnosticsReport, Router, RouterState};
pub use value::{Params, Row, SqlValue};
pub use verify::{VerificationResult, VerificationStatus};
