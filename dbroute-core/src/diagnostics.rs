//! Static configuration sanity checks.
//!
//! Independent of live connectivity. Errors mean a backend cannot possibly
//! be reached with the given settings; warnings are advisory and never
//! block selection. Secrets are reported only as `[set]`/`[missing]`.

use serde::Serialize;
use url::Url;

use crate::config::{Config, LegacyTarget, PrimaryTarget};

const SET: &str = "[set]";
const MISSING: &str = "[missing]";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub details: DiagnosticDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticDetails {
    pub primary_connection_string: &'static str,
    pub primary_public_url: &'static str,
    pub primary_public_key: &'static str,
    pub legacy_host: String,
    pub legacy_database: String,
    pub environment: String,
}

impl Diagnostics {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every check against `config`.
pub fn validate(config: &Config) -> Diagnostics {
    let mut diagnostics = Diagnostics {
        details: DiagnosticDetails {
            primary_connection_string: marker(&config.primary.connection_string),
            primary_public_url: marker(&config.primary.public_url),
            primary_public_key: marker(&config.primary.public_key),
            legacy_host: or_missing(&config.legacy.host),
            legacy_database: or_missing(&config.legacy.database),
            environment: config.environment.name.clone(),
        },
        ..Default::default()
    };

    check_primary(&config.primary, &mut diagnostics);
    check_legacy(&config.legacy, &mut diagnostics);
    diagnostics
}

fn check_primary(target: &PrimaryTarget, out: &mut Diagnostics) {
    if target.public_url.is_empty() {
        out.warnings.push(
            "Primary public URL is missing. Frontend clients should not use direct DB access."
                .to_string(),
        );
    } else if !target.public_url.starts_with("https://") {
        out.warnings
            .push("Primary public URL should start with https://".to_string());
    }
    if target.public_key.is_empty() {
        out.warnings.push(
            "Primary public key is missing. Ensure frontend does not use direct DB access in production."
                .to_string(),
        );
    }

    if target.connection_string.is_empty() {
        if target.host.is_empty() {
            out.errors.push(
                "Postgres connection details missing. Provide PRIMARY_DB_URL or POSTGRES_URL."
                    .to_string(),
            );
        } else if target.database.is_empty() {
            out.warnings
                .push("Postgres host set without a database name.".to_string());
        }
        return;
    }

    match check_connection_string(&target.connection_string) {
        Ok(warnings) => out.warnings.extend(warnings),
        Err(reason) => out
            .errors
            .push(format!("Invalid Postgres connection string: {}", reason)),
    }
}

/// Structural checks on a connection URL. `Err` when it does not parse at all.
pub fn check_connection_string(raw: &str) -> Result<Vec<String>, String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    let mut warnings = Vec::new();

    if url.username().is_empty() {
        warnings.push("Connection string missing username.".to_string());
    }
    if url.password().map_or(true, str::is_empty) {
        warnings.push("Connection string missing password.".to_string());
    }
    if url.host_str().map_or(true, str::is_empty) {
        warnings.push("Connection string missing host.".to_string());
    }
    if url.path().is_empty() || url.path() == "/" {
        warnings.push("Connection string missing database name.".to_string());
    }

    if raw.matches('@').count() > 1 {
        warnings.push(
            "Connection string contains multiple @ symbols. Password may need URL encoding."
                .to_string(),
        );
    }
    if raw.contains(' ') {
        warnings.push("Connection string contains spaces. URL encoding may be required.".to_string());
    }
    let credentials = raw
        .split_once("://")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.rsplit_once('@'))
        .map(|(creds, _)| creds)
        .unwrap_or_default();
    if credentials.contains('@') && !raw.contains("%40") {
        warnings.push("Password contains @ but is not URL-encoded (%40).".to_string());
    }

    Ok(warnings)
}

fn check_legacy(target: &LegacyTarget, out: &mut Diagnostics) {
    if target.host.is_empty() {
        out.warnings.push("Legacy database host missing.".to_string());
    }
    if target.user.is_empty() {
        out.warnings.push("Legacy database user missing.".to_string());
    }
    if target.password.is_empty() {
        out.warnings
            .push("Legacy database password missing.".to_string());
    }
    if target.database.is_empty() {
        out.warnings
            .push("Legacy database name missing.".to_string());
    }
}

fn marker(value: &str) -> &'static str {
    if value.is_empty() {
        MISSING
    } else {
        SET
    }
}

fn or_missing(value: &str) -> String {
    if value.is_empty() {
        MISSING.to_string()
    } else {
        value.to_string()
    }
}
