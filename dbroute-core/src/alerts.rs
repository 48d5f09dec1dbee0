//! Fire-and-forget critical alerts.
//!
//! Payloads are enriched with severity, timestamp and environment, then
//! handed to an [`AlertSink`]. The webhook sink posts from a detached task;
//! delivery failures are logged, never retried and never surfaced to the
//! code path that raised the alert.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Upper bound for one webhook delivery
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Alert kinds raised by the routing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    DbPrimaryUnavailable,
    DbMisconfiguration,
    DbDegradedMode,
    DbWriteBlocked,
    DbWriteVerificationMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// What the caller supplies
#[derive(Debug, Clone)]
pub struct AlertPayload {
    pub kind: AlertKind,
    pub message: String,
    pub details: Value,
    pub severity: Option<Severity>,
}

impl AlertPayload {
    pub fn new(kind: AlertKind, message: impl Into<String>, details: Value) -> Self {
        Self {
            kind,
            message: message.into(),
            details,
            severity: None,
        }
    }
}

/// Enriched alert as delivered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub details: Value,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub environment: String,
}

/// Destination for alerts. `dispatch` must return without waiting on delivery.
pub trait AlertSink: Send + Sync {
    fn dispatch(&self, alert: Alert);
}

/// Enriches payloads and forwards them to a sink
#[derive(Clone)]
pub struct Alerter {
    sink: Arc<dyn AlertSink>,
    environment: String,
}

impl Alerter {
    pub fn new(sink: Arc<dyn AlertSink>, environment: impl Into<String>) -> Self {
        Self {
            sink,
            environment: environment.into(),
        }
    }

    pub fn send_critical_alert(&self, payload: AlertPayload) {
        let alert = Alert {
            kind: payload.kind,
            message: payload.message,
            details: payload.details,
            severity: payload.severity.unwrap_or(Severity::Critical),
            timestamp: Utc::now(),
            environment: self.environment.clone(),
        };
        self.sink.dispatch(alert);
    }
}

/// POSTs alerts to a webhook, or logs them when no URL is configured
pub struct WebhookAlertSink {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

impl AlertSink for WebhookAlertSink {
    fn dispatch(&self, alert: Alert) {
        let Some(url) = self.url.clone() else {
            log_locally(&alert);
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime for alert delivery");
            log_locally(&alert);
            return;
        };

        let client = self.client.clone();
        handle.spawn(async move {
            let outcome = client
                .post(&url)
                .timeout(DELIVERY_TIMEOUT)
                .json(&alert)
                .send()
                .await;
            match outcome {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(kind = ?alert.kind, "Alert delivered");
                }
                Ok(resp) => {
                    tracing::error!(kind = ?alert.kind, status = %resp.status(), "Alert webhook rejected delivery");
                }
                Err(e) => {
                    tracing::error!(kind = ?alert.kind, error = %e, "Failed to deliver alert");
                }
            }
        });
    }
}

fn log_locally(alert: &Alert) {
    let body = serde_json::to_string(alert).unwrap_or_else(|_| alert.message.clone());
    tracing::error!(target: "dbroute::alert", alert = %body, "DB-ALERT");
}

/// Keeps alerts in memory; for tests and embedding
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.alerts().into_iter().map(|a| a.kind).collect()
    }
}

impl AlertSink for MemoryAlertSink {
    fn dispatch(&self, alert: Alert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}
