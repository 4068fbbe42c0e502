//! Operator health checks for the persistence layer.

use std::fmt;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::credentials::keys;
use crate::gateway::{BackendState, PersistenceGateway};
use crate::model::UserRecord;

/// User id written and read back by `self_test`.
pub const SELF_TEST_USER: &str = "test_user_connection";

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub checks: Vec<Check>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            let mark = if check.passed { "ok" } else { "FAIL" };
            writeln!(f, "[{mark:>4}] {}: {}", check.name, check.detail)?;
        }
        if self.is_healthy() {
            write!(f, "All health checks passed")
        } else {
            write!(f, "Some health checks failed")
        }
    }
}

/// Remote-credential variables that are not set.
pub fn missing_env_vars(lookup: impl Fn(&str) -> Option<String>) -> Vec<&'static str> {
    [keys::PROJECT_ID, keys::CLIENT_EMAIL]
        .into_iter()
        .filter(|key| lookup(*key).is_none_or(|v| v.trim().is_empty()))
        .collect()
}

/// Check against the process environment.
pub async fn check(gateway: &PersistenceGateway) -> HealthReport {
    check_with(gateway, |key| std::env::var(key).ok()).await
}

/// Initialize the gateway and report remote state, local writability and
/// missing credential variables.
pub async fn check_with(
    gateway: &PersistenceGateway,
    lookup: impl Fn(&str) -> Option<String>,
) -> HealthReport {
    let mut report = HealthReport::default();

    let missing = missing_env_vars(lookup);
    report.checks.push(if missing.is_empty() {
        Check::pass("Environment variables", "all required variables present")
    } else {
        Check::fail(
            "Environment variables",
            format!("missing {}", missing.join(", ")),
        )
    });

    gateway.initialize().await;
    report.checks.push(match gateway.state().await {
        BackendState::RemoteReady { backend } => {
            Check::pass("Remote store", format!("{backend} connection successful"))
        }
        BackendState::RemoteUnavailable { kind, reason } => {
            Check::fail("Remote store", format!("{kind:?}: {reason}"))
        }
        BackendState::Uninitialized => Check::fail("Remote store", "not initialized"),
    });

    let dir = gateway.local().dir().display().to_string();
    report.checks.push(match gateway.local().check_writable().await {
        Ok(()) => Check::pass("Local storage", format!("{dir} is writable")),
        Err(e) => Check::fail("Local storage", e.to_string()),
    });

    if report.is_healthy() {
        info!("Health check passed");
    } else {
        warn!(failed = report.failed().count(), "Health check failed");
    }
    report
}

/// Store a throwaway record and read it back through the gateway.
pub async fn self_test(gateway: &PersistenceGateway) -> HealthReport {
    let mut report = HealthReport::default();

    let remote = gateway.initialize().await;
    report.checks.push(if remote {
        Check::pass("Remote store", "initialized")
    } else {
        Check::fail("Remote store", "initialization failed")
    });
    if !remote {
        return report;
    }

    let mut record = UserRecord::with_credential("test123");
    record.extra.insert("test".to_string(), Value::Bool(true));
    record.last_updated = Some(Utc::now());

    let stored = gateway.store_record(SELF_TEST_USER, &record).await;
    report.checks.push(if stored {
        Check::pass("Store", format!("stored {SELF_TEST_USER}"))
    } else {
        Check::fail("Store", format!("could not store {SELF_TEST_USER}"))
    });

    report
        .checks
        .push(match gateway.get_record(SELF_TEST_USER).await {
            Some(found) if found.credential_matches("test123") => {
                let mut fields: Vec<&str> = found.extra.keys().map(String::as_str).collect();
                fields.sort_unstable();
                Check::pass("Retrieve", format!("read back, extra fields {fields:?}"))
            }
            Some(_) => Check::fail("Retrieve", "record read back with different contents"),
            None => Check::fail("Retrieve", format!("could not read {SELF_TEST_USER}")),
        });

    report
}
