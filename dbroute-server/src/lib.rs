//! dbroute-server: HTTP surface for the database router
//!
//! Serves the health and diagnostics contracts, establishes the request
//! context the audit trail reads and guards primary-only routes.

pub mod http;
pub mod tracing_setup;

pub use http::{build_router, run_server, ApiError, AppState, ServerConfig};
