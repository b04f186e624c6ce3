//! Backend registry
//!
//! Immutable table from technology name to constructor. Built once at
//! startup and shared by reference; constructors decode and validate their
//! own option bag and never perform network I/O.

use super::{CredentialBackend, MySqlBackend, PostgresBackend};
use crate::errors::{DbSecretsError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Raw per-connection option bag
pub type ConnectionDetails = serde_json::Map<String, serde_json::Value>;

/// Builds a backend from its option bag
pub type BackendConstructor =
    Arc<dyn Fn(&ConnectionDetails) -> Result<Arc<dyn CredentialBackend>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
    /// alias -> canonical technology name
    aliases: HashMap<String, String>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("technologies", &self.technologies())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl BackendRegistry {
    /// Registry with no technologies
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in MySQL and PostgreSQL backends
    pub fn builtin() -> Self {
        Self::empty()
            .with(MySqlBackend::TECHNOLOGY, |details| {
                Ok(Arc::new(MySqlBackend::new(details)?) as Arc<dyn CredentialBackend>)
            })
            .with_alias("mysql-database-plugin", MySqlBackend::TECHNOLOGY)
            .with_alias("mariadb", MySqlBackend::TECHNOLOGY)
            .with(PostgresBackend::TECHNOLOGY, |details| {
                Ok(Arc::new(PostgresBackend::new(details)?) as Arc<dyn CredentialBackend>)
            })
            .with_alias("postgresql", PostgresBackend::TECHNOLOGY)
            .with_alias("postgresql-database-plugin", PostgresBackend::TECHNOLOGY)
    }

    /// Register a technology constructor
    pub fn with<F>(mut self, technology: &str, constructor: F) -> Self
    where
        F: Fn(&ConnectionDetails) -> Result<Arc<dyn CredentialBackend>> + Send + Sync + 'static,
    {
        info!(technology = %technology, "Registering credential backend");
        self.constructors.insert(technology.to_string(), Arc::new(constructor));
        self
    }

    /// Accept `alias` as another name for `technology`
    pub fn with_alias(mut self, alias: &str, technology: &str) -> Self {
        self.aliases.insert(alias.to_string(), technology.to_string());
        self
    }

    /// Resolve a name or alias to the canonical technology name
    pub fn canonical<'a>(&'a self, technology: &'a str) -> Option<&'a str> {
        let name = self.aliases.get(technology).map(String::as_str).unwrap_or(technology);
        self.constructors.get_key_value(name).map(|(k, _)| k.as_str())
    }

    pub fn supports(&self, technology: &str) -> bool {
        self.canonical(technology).is_some()
    }

    /// Registered canonical names, sorted
    pub fn technologies(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a backend. Pure function of the two inputs.
    pub fn build(
        &self,
        technology: &str,
        details: &ConnectionDetails,
    ) -> Result<Arc<dyn CredentialBackend>> {
        let canonical = self
            .canonical(technology)
            .ok_or_else(|| DbSecretsError::unsupported_technology(technology))?;
        let constructor = self
            .constructors
            .get(canonical)
            .ok_or_else(|| DbSecretsError::unsupported_technology(technology))?;

        let backend = constructor(details)?;
        debug!(technology = %canonical, "Built credential backend");
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn details(value: serde_json::Value) -> ConnectionDetails {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_builtin_technologies() {
        let registry = BackendRegistry::builtin();
        assert_eq!(registry.technologies(), vec!["mysql", "postgres"]);
        assert_eq!(registry.canonical("mysql-database-plugin"), Some("mysql"));
        assert_eq!(registry.canonical("postgresql-database-plugin"), Some("postgres"));
        assert_eq!(registry.canonical("postgres"), Some("postgres"));
        assert!(!registry.supports("oracle"));
    }

    #[test]
    fn test_build_unknown_technology() {
        let registry = BackendRegistry::builtin();
        let err = registry.build("oracle", &details(json!({}))).unwrap_err();
        assert!(matches!(err, DbSecretsError::UnsupportedTechnology { .. }));
    }

    #[test]
    fn test_build_invalid_config_fails_fast() {
        let registry = BackendRegistry::builtin();
        let err = registry.build("mysql", &details(json!({"username": "root"}))).unwrap_err();
        assert!(matches!(err, DbSecretsError::InvalidConfig { .. }));
    }

    #[test]
    fn test_build_through_alias() {
        let registry = BackendRegistry::builtin();
        let backend = registry
            .build(
                "mysql-database-plugin",
                &details(json!({"connection_url": "mysql://root@db:3306/"})),
            )
            .unwrap();
        assert_eq!(backend.technology(), "mysql");
    }

    #[test]
    fn test_empty_registry_rejects_everything() {
        let registry = BackendRegistry::empty();
        assert!(registry.technologies().is_empty());
        assert!(registry.build("mysql", &details(json!({}))).is_err());
    }

    #[test]
    fn test_alias_to_missing_technology_is_unsupported() {
        let registry = BackendRegistry::empty().with_alias("legacy", "gone");
        assert_eq!(registry.canonical("legacy"), None);
    }
}
