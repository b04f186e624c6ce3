//! # Roles and Static Accounts
//!
//! Persisted role records. Dynamic roles are templates for minting
//! short-lived principals; static roles pin one long-lived account whose
//! password is rotated on a fixed period.

pub mod store;

pub use store::RoleStore;

use crate::engines::CredentialType;
use crate::errors::{DbSecretsError, Result};
use crate::secrets::types::exposed;
use crate::secrets::SecretString;
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration as StdDuration;

lazy_static! {
    static ref ROLE_NAME_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,63}$")
        .expect("ROLE_NAME_REGEX should be a valid regex pattern");
}

/// Role and connection names: alphanumeric start, then `_`, `.`, `-`
pub fn validate_name(name: &str, field: &str) -> Result<()> {
    if ROLE_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(DbSecretsError::validation_field(
            format!("'{}' is not a valid {} (1-64 chars of [a-zA-Z0-9_.-])", name, field),
            field,
        ))
    }
}

/// Templated statements attached to a role.
///
/// Empty lists select the backend's built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Statements {
    pub creation: Vec<String>,
    pub revocation: Vec<String>,
    pub rotation: Vec<String>,
}

/// Template for minting a fresh principal per lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicRole {
    /// Connection name the role issues credentials against
    pub db_name: String,
    #[serde(default)]
    pub statements: Statements,
    /// Lease duration in seconds; 0 falls back to `max_ttl_seconds`
    #[serde(default)]
    pub default_ttl_seconds: u64,
    /// Upper bound on lease duration in seconds; 0 means unbounded
    #[serde(default)]
    pub max_ttl_seconds: u64,
    #[serde(default)]
    pub credential_type: CredentialType,
    #[serde(default)]
    pub credential_config: serde_json::Map<String, serde_json::Value>,
}

impl DynamicRole {
    /// Lease duration: the default TTL clamped by the max TTL
    pub fn lease_ttl(&self) -> StdDuration {
        let ttl = match (self.default_ttl_seconds, self.max_ttl_seconds) {
            (0, max) => max,
            (ttl, 0) => ttl,
            (ttl, max) => ttl.min(max),
        };
        StdDuration::from_secs(ttl)
    }
}

/// Schedule position of a static account at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Next rotation time is still in the future
    Current,
    /// Next rotation time has passed
    Due,
}

/// A long-lived principal whose password is managed on a fixed cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticAccount {
    pub username: String,
    #[serde(with = "exposed")]
    pub password: SecretString,
    pub last_rotation: DateTime<Utc>,
    /// Seconds between rotations; zero or negative means always due
    pub rotation_period_seconds: i64,
    #[serde(default)]
    pub revoke_on_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_policy: Option<String>,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StaticAccount {
    /// Saturates at `Duration::MIN`/`MAX` for periods chrono cannot represent
    pub fn rotation_period(&self) -> Duration {
        Duration::try_seconds(self.rotation_period_seconds).unwrap_or(
            if self.rotation_period_seconds < 0 { Duration::MIN } else { Duration::MAX },
        )
    }

    pub fn next_rotation_time(&self) -> DateTime<Utc> {
        let period = self.rotation_period();
        self.last_rotation.checked_add_signed(period).unwrap_or(if period < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
    }

    /// Remaining time before the account is due; always recomputed from `now`
    pub fn ttl(&self, now: DateTime<Utc>) -> Duration {
        self.next_rotation_time().signed_duration_since(now)
    }

    pub fn schedule(&self, now: DateTime<Utc>) -> Schedule {
        if self.rotation_period_seconds <= 0 || self.next_rotation_time() <= now {
            Schedule::Due
        } else {
            Schedule::Current
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>, password: SecretString) {
        self.password = password;
        self.last_rotation = at;
        self.failure_count = 0;
        self.last_failure = None;
        self.last_error = None;
    }

    /// Note a failed attempt; `last_rotation` is left untouched
    pub fn record_failure(&mut self, at: DateTime<Utc>, error: &DbSecretsError) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(at);
        self.last_error = Some(error.to_string());
    }
}

/// Static role record stored at `static-roles/<technology>/<name>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRole {
    pub db_name: String,
    /// Statements run to set the new password; empty uses backend defaults
    #[serde(default)]
    pub rotation_statements: Vec<String>,
    #[serde(default)]
    pub credential_type: CredentialType,
    pub account: StaticAccount,
}

/// Identity of a static role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StaticRoleKey {
    pub technology: String,
    pub name: String,
}

impl StaticRoleKey {
    pub fn new(technology: impl Into<String>, name: impl Into<String>) -> Self {
        Self { technology: technology.into(), name: name.into() }
    }

    pub fn storage_key(&self) -> String {
        crate::storage::keys::static_role_key(&self.technology, &self.name)
    }
}

impl fmt::Display for StaticRoleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.technology, self.name)
    }
}
