//! Environment → connection targets + router policy.
//!
//! Resolution is pure: no I/O and no errors. Missing values fall back to
//! defaults; sanity checks live in [`crate::diagnostics`].

use std::collections::HashMap;

use crate::adapter::Backend;

pub const DEFAULT_PRIMARY_PORT: u16 = 5432;
pub const DEFAULT_LEGACY_PORT: u16 = 1433;
pub const DEFAULT_LOG_TABLE: &str = "db_logs";
pub const DEFAULT_SOURCE_SERVICE: &str = "dbroute";

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub primary: PrimaryTarget,
    pub legacy: LegacyTarget,
    pub policy: RouterPolicy,
    pub environment: Environment,
    pub audit: AuditConfig,
    pub alerts: AlertConfig,
}

/// Postgres-compatible primary backend
#[derive(Debug, Clone)]
pub struct PrimaryTarget {
    /// Full connection URL; takes precedence over the individual parts
    pub connection_string: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    /// Public client endpoint handed to browser clients
    pub public_url: String,
    pub public_key: String,
    /// Extra table counted during ping
    pub probe_table: Option<String>,
}

/// SQL-Server-compatible legacy backend
#[derive(Debug, Clone)]
pub struct LegacyTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub encrypt: bool,
    pub trust_cert: bool,
}

/// Raw router flags as configured (not yet gated by environment)
#[derive(Debug, Clone, Default)]
pub struct RouterPolicy {
    /// Raw `DB_DIALECT` value, lowercased; empty when unset
    pub forced_dialect: String,
    pub allow_force: bool,
    /// Production additionally requires this before a force is honored
    pub allow_force_in_prod: bool,
    pub allow_fallback: bool,
    pub allow_mock: bool,
    pub require_primary: bool,
    pub degraded_read_only: bool,
    pub verify_writes: bool,
}

#[derive(Debug, Clone)]
pub struct Environment {
    pub name: String,
    pub production: bool,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub table: String,
    pub source_service: String,
}

#[derive(Debug, Clone, Default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
}

/// Policy after environment gating. Computed on every router init.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EffectivePolicy {
    pub allow_force: bool,
    pub allow_fallback: bool,
    pub allow_mock: bool,
    pub require_primary: bool,
    pub degraded_read_only: bool,
    pub verify_writes: bool,
}

/// Parsed `DB_DIALECT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedDialect {
    Backend(Backend),
    Unrecognized,
}

impl Config {
    /// Resolve from the current process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Resolve from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = Vars(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );

        let environment = {
            let app_env = env.first(&["APP_ENV"]);
            let context = env.first(&["DEPLOY_CONTEXT"]);
            let production = app_env.as_deref() == Some("production")
                || context.as_deref() == Some("production");
            Environment {
                name: context
                    .or(app_env)
                    .unwrap_or_else(|| "development".to_string()),
                production,
            }
        };

        let primary = PrimaryTarget {
            connection_string: env
                .first(&[
                    "PRIMARY_DB_URL",
                    "POSTGRES_URL",
                    "DATABASE_URL",
                    "PG_CONNECTION_STRING",
                ])
                .unwrap_or_default(),
            host: env.first(&["PRIMARY_DB_HOST", "PGHOST"]).unwrap_or_default(),
            port: env
                .first(&["PRIMARY_DB_PORT", "PGPORT"])
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PRIMARY_PORT),
            database: env
                .first(&["PRIMARY_DB_NAME", "PGDATABASE"])
                .unwrap_or_else(|| "postgres".to_string()),
            user: env
                .first(&["PRIMARY_DB_USER", "PGUSER"])
                .unwrap_or_else(|| "postgres".to_string()),
            password: env
                .first(&["PRIMARY_DB_PASSWORD", "PGPASSWORD"])
                .unwrap_or_default(),
            ssl: env.is_true("PRIMARY_DB_SSL")
                || env.first(&["PGSSLMODE"]).as_deref() == Some("require")
                || environment.production,
            public_url: env.first(&["PRIMARY_PUBLIC_URL"]).unwrap_or_default(),
            public_key: env.first(&["PRIMARY_PUBLIC_KEY"]).unwrap_or_default(),
            probe_table: env.first(&["DB_PROBE_TABLE"]),
        };

        let legacy = LegacyTarget {
            host: env.first(&["LEGACY_DB_HOST"]).unwrap_or_default(),
            port: env
                .first(&["LEGACY_DB_PORT"])
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_LEGACY_PORT),
            database: env
                .first(&["LEGACY_DB_NAME"])
                .unwrap_or_else(|| "master".to_string()),
            user: env.first(&["LEGACY_DB_USER"]).unwrap_or_default(),
            password: env.first(&["LEGACY_DB_PASSWORD"]).unwrap_or_default(),
            encrypt: env.is_true("LEGACY_DB_ENCRYPT"),
            trust_cert: env.is_true("LEGACY_DB_TRUST_CERT"),
        };

        let policy = RouterPolicy {
            forced_dialect: env
                .first(&["DB_DIALECT"])
                .map(|d| d.to_ascii_lowercase())
                .unwrap_or_default(),
            allow_force: env.is_true("DB_ROUTER_ALLOW_FORCE"),
            allow_force_in_prod: env.is_true("DB_ROUTER_ALLOW_FORCE_IN_PROD"),
            allow_fallback: env.is_true("DB_ROUTER_ALLOW_FALLBACK"),
            allow_mock: env.is_true("DB_ROUTER_ALLOW_MOCK"),
            require_primary: !env.is_false("DB_ROUTER_REQUIRE_PRIMARY"),
            degraded_read_only: !env.is_false("DB_DEGRADED_READONLY"),
            verify_writes: !env.is_false("DB_VERIFY_WRITES"),
        };

        let audit = AuditConfig {
            enabled: !env.is_false("DB_LOGGING_ENABLED"),
            table: env
                .first(&["DB_LOG_TABLE"])
                .unwrap_or_else(|| DEFAULT_LOG_TABLE.to_string()),
            source_service: env
                .first(&["DB_LOG_SOURCE"])
                .unwrap_or_else(|| DEFAULT_SOURCE_SERVICE.to_string()),
        };

        let alerts = AlertConfig {
            webhook_url: env.first(&["CRITICAL_ALERT_WEBHOOK_URL", "ALERT_WEBHOOK_URL"]),
        };

        Self {
            primary,
            legacy,
            policy,
            environment,
            audit,
            alerts,
        }
    }

    /// Gate the raw flags by environment.
    ///
    /// Fallback and mock are on by default outside production and opt-in in
    /// production. Forcing needs a second, production-only opt-in. Read-only
    /// degraded mode only applies in production.
    pub fn effective_policy(&self) -> EffectivePolicy {
        let prod = self.environment.production;
        let p = &self.policy;
        EffectivePolicy {
            allow_force: p.allow_force && (!prod || p.allow_force_in_prod),
            allow_fallback: p.allow_fallback || !prod,
            allow_mock: p.allow_mock || !prod,
            require_primary: p.require_primary,
            degraded_read_only: p.degraded_read_only && prod,
            verify_writes: p.verify_writes,
        }
    }

    pub fn forced_dialect(&self) -> Option<ForcedDialect> {
        match self.policy.forced_dialect.as_str() {
            "" => None,
            "primary" | "postgres" => Some(ForcedDialect::Backend(Backend::Primary)),
            "legacy" | "mssql" => Some(ForcedDialect::Backend(Backend::Legacy)),
            "mock" => Some(ForcedDialect::Backend(Backend::Mock)),
            _ => Some(ForcedDialect::Unrecognized),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_vars(std::iter::empty::<(String, String)>())
    }
}

struct Vars(HashMap<String, String>);

impl Vars {
    /// First non-empty value among `keys`.
    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.0.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn is_true(&self, key: &str) -> bool {
        self.0.get(key).map(|v| v.trim()) == Some("true")
    }

    fn is_false(&self, key: &str) -> bool {
        self.0.get(key).map(|v| v.trim()) == Some("false")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        Config::from_vars(vars.iter().copied())
    }

    #[test]
    fn defaults_without_environment() {
        let c = config(&[]);
        assert!(c.primary.connection_string.is_empty());
        assert_eq!(c.primary.port, DEFAULT_PRIMARY_PORT);
        assert_eq!(c.primary.database, "postgres");
        assert_eq!(c.legacy.port, DEFAULT_LEGACY_PORT);
        assert_eq!(c.legacy.database, "master");
        assert!(!c.environment.production);
        assert!(c.policy.require_primary);
        assert!(c.policy.degraded_read_only);
        assert!(c.policy.verify_writes);
        assert!(c.audit.enabled);
        assert_eq!(c.audit.table, DEFAULT_LOG_TABLE);
        assert!(c.alerts.webhook_url.is_none());
        assert!(c.forced_dialect().is_none());
    }

    #[test]
    fn connection_string_precedence() {
        let c = config(&[
            ("DATABASE_URL", "postgres://c"),
            ("POSTGRES_URL", "postgres://b"),
            ("PRIMARY_DB_URL", ""),
        ]);
        assert_eq!(c.primary.connection_string, "postgres://b");
    }

    #[test]
    fn outside_production_fallback_and_mock_default_on() {
        let p = config(&[]).effective_policy();
        assert!(p.allow_fallback);
        assert!(p.allow_mock);
        assert!(!p.allow_force);
        assert!(!p.degraded_read_only);
    }

    #[test]
    fn production_requires_opt_in() {
        let p = config(&[("APP_ENV", "production")]).effective_policy();
        assert!(!p.allow_fallback);
        assert!(!p.allow_mock);
        assert!(p.degraded_read_only);

        let p = config(&[
            ("DEPLOY_CONTEXT", "production"),
            ("DB_ROUTER_ALLOW_FALLBACK", "true"),
            ("DB_ROUTER_ALLOW_FORCE", "true"),
        ])
        .effective_policy();
        assert!(p.allow_fallback);
        assert!(!p.allow_force, "force needs the production opt-in too");

        let p = config(&[
            ("APP_ENV", "production"),
            ("DB_ROUTER_ALLOW_FORCE", "true"),
            ("DB_ROUTER_ALLOW_FORCE_IN_PROD", "true"),
        ])
        .effective_policy();
        assert!(p.allow_force);
    }

    #[test]
    fn production_forces_tls() {
        assert!(config(&[("APP_ENV", "production")]).primary.ssl);
        assert!(config(&[("PGSSLMODE", "require")]).primary.ssl);
        assert!(!config(&[]).primary.ssl);
    }

    #[test]
    fn forced_dialect_parsing() {
        assert_eq!(
            config(&[("DB_DIALECT", "MSSQL")]).forced_dialect(),
            Some(ForcedDialect::Backend(Backend::Legacy))
        );
        assert_eq!(
            config(&[("DB_DIALECT", "postgres")]).forced_dialect(),
            Some(ForcedDialect::Backend(Backend::Primary))
        );
        assert_eq!(
            config(&[("DB_DIALECT", "oracle")]).forced_dialect(),
            Some(ForcedDialect::Unrecognized)
        );
    }

    #[test]
    fn opt_out_flags() {
        let c = config(&[
            ("DB_VERIFY_WRITES", "false"),
            ("DB_DEGRADED_READONLY", "false"),
            ("DB_LOGGING_ENABLED", "false"),
            ("ALERT_WEBHOOK_URL", "https://hooks.example/x"),
        ]);
        assert!(!c.policy.verify_writes);
        assert!(!c.policy.degraded_read_only);
        assert!(!c.audit.enabled);
        assert_eq!(c.alerts.webhook_url.as_deref(), Some("https://hooks.example/x"));
    }
}
