//! Storage key layout.
//!
//! - `config/<name>`: connection configuration
//! - `roles/<technology>/<name>`: dynamic role
//! - `static-roles/<technology>/<name>`: static role and its managed account

pub const CONNECTION_CONFIG_PREFIX: &str = "config/";
pub const DYNAMIC_ROLE_PREFIX: &str = "roles/";
pub const STATIC_ROLE_PREFIX: &str = "static-roles/";

pub fn connection_config_key(name: &str) -> String {
    format!("{}{}", CONNECTION_CONFIG_PREFIX, name)
}

/// Connection name for a configuration key, if `key` is one
pub fn connection_name_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(CONNECTION_CONFIG_PREFIX).filter(|name| !name.is_empty() && !name.contains('/'))
}

pub fn dynamic_role_key(technology: &str, name: &str) -> String {
    format!("{}{}/{}", DYNAMIC_ROLE_PREFIX, technology, name)
}

pub fn dynamic_role_prefix(technology: &str) -> String {
    format!("{}{}/", DYNAMIC_ROLE_PREFIX, technology)
}

pub fn static_role_key(technology: &str, name: &str) -> String {
    format!("{}{}/{}", STATIC_ROLE_PREFIX, technology, name)
}

pub fn static_role_prefix(technology: &str) -> String {
    format!("{}{}/", STATIC_ROLE_PREFIX, technology)
}
