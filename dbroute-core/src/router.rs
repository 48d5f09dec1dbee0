//! Backend selection.
//!
//! The router probes both real backends, picks one active adapter according
//! to the effective policy and keeps the outcome as [`RouterState`].
//! Initialization runs once; concurrent callers during a cold start wait on
//! the same gate and share its result. `init(true)` re-probes.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::adapter::{Adapter, Adapters, Backend};
use crate::alerts::{AlertKind, AlertPayload, Alerter, WebhookAlertSink};
use crate::config::{Config, EffectivePolicy, ForcedDialect};
use crate::diagnostics::{self, Diagnostics};
use crate::error::{DbError, Result};
use crate::health::{self, AdapterHealth};

/// Outcome of the last initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterState {
    pub initialized: bool,
    pub active: Option<Backend>,
    pub primary_health: Option<AdapterHealth>,
    pub legacy_health: Option<AdapterHealth>,
    /// Active backend is anything but the primary (including none)
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub misconfiguration: Option<String>,
    pub degraded_read_only: bool,
    pub diagnostics: Diagnostics,
    pub policy: EffectivePolicy,
    pub last_init: Option<DateTime<Utc>>,
}

impl RouterState {
    pub fn primary_ok(&self) -> bool {
        self.primary_health.as_ref().is_some_and(|h| h.ok)
    }

    /// Writes are refused in this state.
    pub fn blocks_writes(&self) -> bool {
        self.degraded && self.degraded_read_only
    }
}

/// Per-backend part of the diagnostics contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub ok: bool,
    pub error: Option<String>,
}

impl ProbeSummary {
    fn from_health(health: Option<&AdapterHealth>) -> Self {
        match health {
            Some(h) => Self {
                ok: h.ok,
                error: h.error.clone(),
            },
            None => Self {
                ok: false,
                error: Some("not probed".to_string()),
            },
        }
    }
}

/// Diagnostics endpoint contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsReport {
    pub active_database: String,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub misconfiguration: Option<String>,
    pub primary: ProbeSummary,
    pub legacy: ProbeSummary,
    pub diagnostics: Diagnostics,
    pub last_init: Option<DateTime<Utc>>,
    pub policy: EffectivePolicy,
}

impl DiagnosticsReport {
    pub fn from_state(state: &RouterState) -> Self {
        Self {
            active_database: active_name(state.active).to_string(),
            degraded: state.degraded,
            degraded_reason: state.degraded_reason.clone(),
            misconfiguration: state.misconfiguration.clone(),
            primary: ProbeSummary::from_health(state.primary_health.as_ref()),
            legacy: ProbeSummary::from_health(state.legacy_health.as_ref()),
            diagnostics: state.diagnostics.clone(),
            last_init: state.last_init,
            policy: state.policy,
        }
    }
}

fn active_name(active: Option<Backend>) -> &'static str {
    active.map(Backend::as_str).unwrap_or("none")
}

pub struct Router {
    config: Config,
    adapters: Adapters,
    alerter: Alerter,
    state: RwLock<RouterState>,
    init_gate: Mutex<()>,
}

impl Router {
    pub fn new(config: Config, adapters: Adapters, alerter: Alerter) -> Self {
        Self {
            config,
            adapters,
            alerter,
            state: RwLock::new(RouterState::default()),
            init_gate: Mutex::new(()),
        }
    }

    /// Real adapters and the webhook alert sink. Must be called inside a Tokio runtime.
    pub fn from_config(config: Config) -> Self {
        let adapters = Adapters::from_config(&config);
        let alerter = Alerter::new(
            Arc::new(WebhookAlertSink::new(config.alerts.webhook_url.clone())),
            config.environment.name.clone(),
        );
        Self::new(config, adapters, alerter)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn alerter(&self) -> &Alerter {
        &self.alerter
    }

    /// Initialize once, or re-probe when `force` is set.
    pub async fn init(&self, force: bool) -> RouterState {
        if !force {
            let state = self.state();
            if state.initialized {
                return state;
            }
        }

        let _gate = self.init_gate.lock().await;
        if !force {
            // Another caller may have finished while we waited.
            let state = self.state();
            if state.initialized {
                return state;
            }
        }

        let state = self.select().await;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state.clone();
        state
    }

    async fn select(&self) -> RouterState {
        let policy = self.config.effective_policy();
        let production = self.config.environment.production;

        let diagnostics = diagnostics::validate(&self.config);
        if !diagnostics.errors.is_empty() {
            tracing::error!(errors = ?diagnostics.errors, "DB-DIAGNOSTICS: configuration errors");
        }
        if !diagnostics.warnings.is_empty() {
            tracing::warn!(warnings = ?diagnostics.warnings, "DB-DIAGNOSTICS: configuration warnings");
        }

        let (primary, legacy) =
            health::probe_pair(self.adapters.primary.as_ref(), self.adapters.legacy.as_ref())
                .await;

        let mut active = if primary.ok {
            Some(Backend::Primary)
        } else if policy.allow_fallback && legacy.ok {
            Some(Backend::Legacy)
        } else if policy.allow_mock {
            Some(Backend::Mock)
        } else {
            None
        };

        let mut misconfiguration = None;
        match self.config.forced_dialect() {
            None => {}
            Some(ForcedDialect::Unrecognized) => {
                misconfiguration = Some(format!(
                    "DB_DIALECT={} not recognized; ignored",
                    self.config.policy.forced_dialect
                ));
            }
            Some(ForcedDialect::Backend(forced)) if policy.allow_force => match forced {
                Backend::Primary if primary.ok => active = Some(Backend::Primary),
                Backend::Legacy if legacy.ok => active = Some(Backend::Legacy),
                Backend::Mock => active = Some(Backend::Mock),
                _ => {}
            },
            Some(ForcedDialect::Backend(forced)) => {
                if primary.ok && forced != Backend::Primary {
                    misconfiguration = Some(format!("DB_DIALECT={} overridden to primary", forced));
                }
            }
        }

        let degraded = active != Some(Backend::Primary);
        let degraded_reason = (!primary.ok).then(|| {
            primary
                .error
                .clone()
                .unwrap_or_else(|| "Primary connectivity failed".to_string())
        });

        if !primary.ok {
            self.alerter.send_critical_alert(AlertPayload::new(
                AlertKind::DbPrimaryUnavailable,
                "Primary connectivity test failed during startup.",
                serde_json::to_value(&primary).unwrap_or_default(),
            ));
        }
        if let Some(message) = &misconfiguration {
            tracing::warn!(%message, "Router misconfiguration");
            self.alerter.send_critical_alert(AlertPayload::new(
                AlertKind::DbMisconfiguration,
                message.clone(),
                json!({ "diagnostics": diagnostics }),
            ));
        }
        if degraded && production {
            self.alerter.send_critical_alert(AlertPayload::new(
                AlertKind::DbDegradedMode,
                format!("Database router in degraded mode ({}).", active_name(active)),
                json!({
                    "active": active,
                    "allow_fallback": policy.allow_fallback,
                    "allow_mock": policy.allow_mock,
                    "require_primary": policy.require_primary,
                    "diagnostics": diagnostics,
                }),
            ));
        }

        tracing::info!(
            active = active_name(active),
            degraded,
            primary_ok = primary.ok,
            legacy_ok = legacy.ok,
            "Database router initialized"
        );

        RouterState {
            initialized: true,
            active,
            primary_health: Some(primary),
            legacy_health: Some(legacy),
            degraded,
            degraded_reason,
            misconfiguration,
            degraded_read_only: policy.degraded_read_only,
            diagnostics,
            policy,
            last_init: Some(Utc::now()),
        }
    }

    /// Copy of the current state.
    pub fn state(&self) -> RouterState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_adapter(&self) -> Option<Arc<dyn Adapter>> {
        let active = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active;
        active.map(|b| self.adapter(b))
    }

    pub fn adapter(&self, backend: Backend) -> Arc<dyn Adapter> {
        Arc::clone(self.adapters.get(backend))
    }

    pub fn primary_adapter(&self) -> Arc<dyn Adapter> {
        Arc::clone(&self.adapters.primary)
    }

    /// Dialect of the active backend; primary until one is selected.
    pub fn dialect(&self) -> Backend {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .unwrap_or(Backend::Primary)
    }

    pub async fn diagnostics_report(&self) -> DiagnosticsReport {
        DiagnosticsReport::from_state(&self.init(false).await)
    }

    /// Reject when production requires the primary and it is not active.
    pub async fn require_primary(&self) -> Result<()> {
        let state = self.init(false).await;
        if self.config.environment.production
            && state.policy.require_primary
            && state.active != Some(Backend::Primary)
        {
            return Err(DbError::primary_required());
        }
        Ok(())
    }
}
