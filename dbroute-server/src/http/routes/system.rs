//! Database system endpoints
//!
//! - `GET /api/system/db-health` - health contract
//! - `GET /api/system/db-diagnostics` - router state, probes and config checks
//! - `GET /api/system/db-tables` - base tables of a schema; primary only

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::middleware;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use dbroute_core::health::{self, DbHealth};
use dbroute_core::{params, DiagnosticsReport, QueryOptions};

use crate::http::error::ApiError;
use crate::http::middleware::require_primary;
use crate::http::server::AppState;

const DEFAULT_SCHEMA: &str = "public";

async fn db_health(State(state): State<Arc<AppState>>) -> Json<DbHealth> {
    Json(health::db_health(state.repo.router()).await)
}

async fn db_diagnostics(State(state): State<Arc<AppState>>) -> Json<DiagnosticsReport> {
    Json(state.repo.router().diagnostics_report().await)
}

#[derive(Debug, Deserialize)]
pub struct TablesQuery {
    pub schema: Option<String>,
}

async fn db_tables(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TablesQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let schema = query.schema.unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
    let rows = state
        .repo
        .query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = @Schema AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &params! { "Schema" => schema },
            QueryOptions::new(),
        )
        .await?;

    let names = rows
        .into_iter()
        .filter_map(|mut row| row.remove("table_name"))
        .map(|name| name.to_string())
        .collect();
    Ok(Json(names))
}

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let primary_only = Router::new()
        .route("/api/system/db-tables", get(db_tables))
        .route_layer(middleware::from_fn_with_state(state, require_primary));

    Router::new()
        .route("/api/system/db-health", get(db_health))
        .route("/api/system/db-diagnostics", get(db_diagnostics))
        .merge(primary_only)
}
