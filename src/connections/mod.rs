//! # Connections
//!
//! Persisted connection configuration records and the cache of live
//! credential backends built from them.

pub mod manager;
pub mod resolver;

pub use manager::ConnectionManager;
pub use resolver::BackendResolver;

use crate::engines::ConnectionDetails;
use serde::{Deserialize, Serialize};

fn default_verify_connection() -> bool {
    true
}

/// Connection configuration record stored at `config/<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Technology name or alias understood by the backend registry
    pub plugin_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_version: Option<String>,

    /// Raw option bag handed to the technology constructor
    #[serde(default)]
    pub connection_details: ConnectionDetails,

    /// Role names allowed to use this connection; `*` globs are accepted
    #[serde(default)]
    pub allowed_roles: Vec<String>,

    /// Default password policy for roles on this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_policy: Option<String>,

    #[serde(default = "default_verify_connection")]
    pub verify_connection: bool,
}

impl ConnectionConfig {
    pub fn new(plugin_name: impl Into<String>, connection_details: ConnectionDetails) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            plugin_version: None,
            connection_details,
            allowed_roles: Vec::new(),
            password_policy: None,
            verify_connection: true,
        }
    }

    /// Whether `role` may be bound to this connection
    pub fn allows_role(&self, role: &str) -> bool {
        self.allowed_roles.iter().any(|pattern| glob_matches(pattern, role))
    }
}

/// Match `value` against a pattern where `*` stands for any run of characters
fn glob_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = value.strip_prefix(first) else {
        return false;
    };

    let mut parts: Vec<&str> = parts.collect();
    let last = parts.pop().unwrap_or_default();
    for part in parts {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
