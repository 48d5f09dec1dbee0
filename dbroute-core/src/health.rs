//! Health probing and the health endpoint contract.
//!
//! A probe never fails: errors and panics inside `ping()` are captured into
//! the returned [`AdapterHealth`]. Both backends are probed concurrently and
//! independently.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;

use crate::adapter::{Adapter, Backend, Timing};
use crate::router::{Router, RouterState};

/// Snapshot of one backend's connectivity for one init cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterHealth {
    pub ok: bool,
    pub label: Backend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_query_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub timings: Vec<Timing>,
}

impl AdapterHealth {
    pub fn failed(label: Backend, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            label,
            latency_ms: None,
            error: Some(error.into()),
            last_successful_query_time: None,
            timings: Vec::new(),
        }
    }
}

/// Ping `adapter`, turning every failure mode into an unhealthy snapshot.
pub async fn probe(adapter: &dyn Adapter, label: Backend) -> AdapterHealth {
    // The call itself happens inside the guarded future, so a panic raised
    // before the ping future exists is caught as well.
    let outcome = AssertUnwindSafe(async { adapter.ping().await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(report)) => AdapterHealth {
            ok: true,
            label,
            latency_ms: Some(report.latency_ms),
            error: None,
            last_successful_query_time: Some(report.last_successful_query_time),
            timings: report.timings,
        },
        Ok(Err(e)) => {
            tracing::warn!(backend = %label, error = %e, "Health probe failed");
            AdapterHealth::failed(label, e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(backend = %label, error = %message, "Health probe panicked");
            AdapterHealth::failed(label, message)
        }
    }
}

/// Probe primary and legacy at the same time.
pub async fn probe_pair(
    primary: &dyn Adapter,
    legacy: &dyn Adapter,
) -> (AdapterHealth, AdapterHealth) {
    tokio::join!(
        probe(primary, Backend::Primary),
        probe(legacy, Backend::Legacy)
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("ping panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("ping panicked: {}", s)
    } else {
        "ping panicked".to_string()
    }
}

/// `connection_status` of the health contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Ok,
    Degraded,
    Down,
}

/// Health endpoint contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbHealth {
    pub active_database: String,
    pub connection_status: ConnectionStatus,
    pub latency_ms: Option<u64>,
    pub last_successful_query_time: Option<DateTime<Utc>>,
}

impl DbHealth {
    pub fn from_state(state: &RouterState) -> Self {
        let primary = state.primary_health.as_ref();
        let connection_status = match state.active {
            None => ConnectionStatus::Down,
            Some(_) if state.degraded => ConnectionStatus::Degraded,
            Some(_) => ConnectionStatus::Ok,
        };
        Self {
            active_database: state
                .active
                .map(|b| b.as_str().to_string())
                .unwrap_or_else(|| "none".to_string()),
            connection_status,
            latency_ms: primary.and_then(|h| h.latency_ms),
            last_successful_query_time: primary.and_then(|h| h.last_successful_query_time),
        }
    }
}

/// Initialize `router` if needed and report its health.
pub async fn db_health(router: &Router) -> DbHealth {
    DbHealth::from_state(&router.init(false).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;

    #[tokio::test]
    async fn mock_probe_is_healthy() {
        let health = probe(&MockAdapter::new(), Backend::Mock).await;
        assert!(health.ok);
        assert_eq!(health.latency_ms, Some(0));
        assert!(health.error.is_none());
    }

    #[test]
    fn health_contract_states() {
        let mut state = RouterState::default();
        assert_eq!(
            DbHealth::from_state(&state).connection_status,
            ConnectionStatus::Down
        );
        assert_eq!(DbHealth::from_state(&state).active_database, "none");

        state.active = Some(Backend::Legacy);
        state.degraded = true;
        assert_eq!(
            DbHealth::from_state(&state).connection_status,
            ConnectionStatus::Degraded
        );

        state.active = Some(Backend::Primary);
        state.degraded = false;
        state.primary_health = Some(AdapterHealth {
            ok: true,
            label: Backend::Primary,
            latency_ms: Some(12),
            error: None,
            last_successful_query_time: None,
            timings: Vec::new(),
        });
        let health = DbHealth::from_state(&state);
        assert_eq!(health.connection_status, ConnectionStatus::Ok);
        assert_eq!(health.latency_ms, Some(12));
        assert_eq!(health.active_database, "primary");
    }

    #[test]
    fn serializes_contract_field_names() {
        let json = serde_json::to_value(DbHealth::from_state(&RouterState::default())).unwrap();
        assert_eq!(json["active_database"], "none");
        assert_eq!(json["connection_status"], "down");
        assert!(json["latency_ms"].is_null());
        assert!(json["last_successful_query_time"].is_null());
    }
}
