//! Process-wide repository.
//!
//! Built lazily from the process environment on first use, so callers can
//! use the free functions here without wiring anything. [`install`] swaps in
//! a prepared repository and [`reset`] drops it; tests use both.

use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;

use crate::adapter::Backend;
use crate::config::Config;
use crate::error::Result;
use crate::repository::{QueryOptions, Repository, TxQuery};
use crate::router::RouterState;
use crate::value::{Params, Row, SqlValue};

static REPOSITORY: RwLock<Option<Arc<Repository>>> = RwLock::new(None);

/// The shared repository, built from the environment if none exists yet.
/// Must be called inside a Tokio runtime.
pub fn repository() -> Arc<Repository> {
    if let Some(repo) = REPOSITORY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        return Arc::clone(repo);
    }

    let mut slot = REPOSITORY.write().unwrap_or_else(PoisonError::into_inner);
    let repo = slot.get_or_insert_with(|| Arc::new(Repository::from_config(Config::from_env())));
    Arc::clone(repo)
}

/// Replace the shared repository.
pub fn install(repo: Repository) -> Arc<Repository> {
    let repo = Arc::new(repo);
    *REPOSITORY.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&repo));
    repo
}

/// Drop the shared repository; the next call rebuilds it.
pub fn reset() {
    REPOSITORY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

pub async fn init_router(force: bool) -> RouterState {
    repository().router().init(force).await
}

pub async fn query(sql: &str, params: &Params, options: QueryOptions) -> Result<Vec<Row>> {
    repository().query(sql, params, options).await
}

pub async fn insert_and_get_id(
    sql: &str,
    params: &Params,
    id_column: &str,
    options: QueryOptions,
) -> Result<Option<SqlValue>> {
    repository()
        .insert_and_get_id(sql, params, id_column, options)
        .await
}

pub async fn with_transaction<T, F>(f: F) -> Result<T>
where
    F: for<'t> FnOnce(&'t mut TxQuery) -> BoxFuture<'t, Result<T>>,
{
    repository().with_transaction(f).await
}

pub fn get_dialect() -> Backend {
    repository().dialect()
}

pub fn sql_limit(count: u64) -> String {
    repository().sql_limit(count)
}

pub fn sql_coalesce<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    crate::sql::coalesce(args)
}
