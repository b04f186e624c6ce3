//! Dynamic and static role business logic
//!
//! Role writes check the target connection exists, serves the same
//! technology and lists the role in `allowed_roles`. Backend calls go
//! through the resolver so they share its deadline and eviction policy.

use crate::connections::{BackendResolver, ConnectionConfig};
use crate::engines::{CredentialType, DeletePrincipal, NewPrincipal};
use crate::errors::{DbSecretsError, Result};
use crate::observability::MetricsRecorder;
use crate::roles::{
    validate_name, DynamicRole, RoleStore, Statements, StaticAccount, StaticRole, StaticRoleKey,
};
use crate::rotation::{state_of, RotationEngine, RotationState};
use crate::secrets::{PasswordGenerator, SecretString};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

const USERNAME_RANDOM_LEN: usize = 20;
const USERNAME_ROLE_LEN: usize = 8;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DynamicRoleRequest {
    #[validate(length(min = 1, message = "db_name is required"))]
    pub db_name: String,
    #[serde(default)]
    pub statements: Statements,
    #[serde(default)]
    pub default_ttl_seconds: u64,
    #[serde(default)]
    pub max_ttl_seconds: u64,
    #[serde(default)]
    pub credential_type: CredentialType,
    #[serde(default)]
    pub credential_config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StaticRoleRequest {
    #[validate(length(min = 1, message = "db_name is required"))]
    pub db_name: String,
    #[validate(length(min = 1, message = "username is required"))]
    pub username: String,
    #[validate(range(
        min = 5,
        max = 315_360_000,
        message = "rotation_period must be between 5 seconds and 10 years"
    ))]
    pub rotation_period_seconds: i64,
    #[serde(default)]
    pub rotation_statements: Vec<String>,
    #[serde(default)]
    pub revoke_on_delete: bool,
    pub password_policy: Option<String>,
    #[serde(default)]
    pub credential_type: CredentialType,
}

/// Freshly minted dynamic credentials
#[derive(Debug, Clone)]
pub struct Lease {
    pub role: String,
    pub db_name: String,
    pub username: String,
    pub password: SecretString,
    /// Zero means the role sets no expiry
    pub ttl: Duration,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Static role as reported to callers; never carries the password
#[derive(Debug, Clone, Serialize)]
pub struct StaticRoleStatus {
    pub db_name: String,
    pub username: String,
    pub rotation_period_seconds: i64,
    pub rotation_statements: Vec<String>,
    pub revoke_on_delete: bool,
    pub password_policy: Option<String>,
    pub credential_type: CredentialType,
    pub last_rotation: DateTime<Utc>,
    pub next_rotation: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub state: String,
    pub failure_count: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Current credentials of a static account
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    pub username: String,
    pub password: SecretString,
    pub last_rotation: DateTime<Utc>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct RoleService {
    roles: RoleStore,
    resolver: BackendResolver,
    passwords: Arc<dyn PasswordGenerator>,
    engine: Arc<RotationEngine>,
    metrics: MetricsRecorder,
}

impl RoleService {
    pub fn new(
        roles: RoleStore,
        resolver: BackendResolver,
        passwords: Arc<dyn PasswordGenerator>,
        engine: Arc<RotationEngine>,
        metrics: MetricsRecorder,
    ) -> Self {
        Self { roles, resolver, passwords, engine, metrics }
    }

    /// Connection `db_name` must exist, serve `technology` and allow `role`
    async fn check_binding(&self, technology: &str, role: &str, db_name: &str) -> Result<ConnectionConfig> {
        let registry = self.resolver.registry();
        let wanted = registry
            .canonical(technology)
            .ok_or_else(|| DbSecretsError::unsupported_technology(technology))?;

        let connection = match self.resolver.load_config(db_name).await {
            Ok(connection) => connection,
            Err(DbSecretsError::NotFound { .. }) => {
                return Err(DbSecretsError::validation_field(
                    format!("Connection '{}' does not exist", db_name),
                    "db_name",
                ))
            }
            Err(e) => return Err(e),
        };

        if registry.canonical(&connection.plugin_name) != Some(wanted) {
            return Err(DbSecretsError::validation_field(
                format!("Connection '{}' is not a {} connection", db_name, wanted),
                "db_name",
            ));
        }
        if !connection.allows_role(role) {
            return Err(DbSecretsError::validation(format!(
                "Role '{}' is not allowed by connection '{}'",
                role, db_name
            )));
        }
        Ok(connection)
    }

    /// Canonical technology name, so aliases share one key space
    fn technology<'a>(&'a self, technology: &'a str) -> Result<&'a str> {
        self.resolver
            .registry()
            .canonical(technology)
            .ok_or_else(|| DbSecretsError::unsupported_technology(technology))
    }

    fn check_policy(&self, policy: Option<&str>) -> Result<()> {
        match policy {
            Some(name) if !name.is_empty() && !self.passwords.has_policy(name) => {
                Err(DbSecretsError::validation_field(
                    format!("Unknown password policy '{}'", name),
                    "password_policy",
                ))
            }
            _ => Ok(()),
        }
    }

    // Dynamic roles

    pub async fn write_dynamic(
        &self,
        technology: &str,
        name: &str,
        request: DynamicRoleRequest,
    ) -> Result<DynamicRole> {
        let technology = self.technology(technology)?;
        validate_name(name, "role name")?;
        request.validate()?;
        self.check_binding(technology, name, &request.db_name).await?;

        let backend = self.resolver.resolve(&request.db_name).await?;
        if !backend.supported_credential_types().contains(&request.credential_type) {
            return Err(DbSecretsError::validation_field(
                format!(
                    "Credential type '{}' is not supported by {}",
                    request.credential_type,
                    backend.technology()
                ),
                "credential_type",
            ));
        }

        let role = DynamicRole {
            db_name: request.db_name,
            statements: request.statements,
            default_ttl_seconds: request.default_ttl_seconds,
            max_ttl_seconds: request.max_ttl_seconds,
            credential_type: request.credential_type,
            credential_config: request.credential_config,
        };
        self.roles.put_dynamic(technology, name, &role).await?;
        info!(technology = %technology, role = %name, db_name = %role.db_name, "Dynamic role written");
        Ok(role)
    }

    pub async fn read_dynamic(&self, technology: &str, name: &str) -> Result<DynamicRole> {
        let technology = self.technology(technology)?;
        self.roles
            .get_dynamic(technology, name)
            .await?
            .ok_or_else(|| DbSecretsError::not_found("Role", name))
    }

    pub async fn delete_dynamic(&self, technology: &str, name: &str) -> Result<()> {
        let technology = self.technology(technology)?;
        self.roles.delete_dynamic(technology, name).await
    }

    pub async fn list_dynamic(&self, technology: &str) -> Result<Vec<String>> {
        let technology = self.technology(technology)?;
        self.roles.list_dynamic(technology).await
    }

    /// Mint a new principal for dynamic role `name`
    pub async fn issue_credentials(&self, technology: &str, name: &str) -> Result<Lease> {
        let technology = self.technology(technology)?;
        let role = self.read_dynamic(technology, name).await?;
        let connection = self.resolver.load_config(&role.db_name).await?;
        let password = self.passwords.generate(connection.password_policy.as_deref()).await?;

        let ttl = role.lease_ttl();
        let expires_at = (!ttl.is_zero())
            .then(|| chrono::Duration::from_std(ttl).ok())
            .flatten()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));

        let statements = role.statements.creation.clone();
        let secret = password.clone();
        let username = self
            .resolver
            .call(&role.db_name, "create_principal", |backend| async move {
                let username = generate_username(name, backend.max_username_len());
                backend
                    .create_principal(NewPrincipal {
                        username: username.clone(),
                        password: secret,
                        statements,
                        expiration: expires_at,
                    })
                    .await?;
                Ok(username)
            })
            .await?;

        self.metrics.record_credentials_issued(technology);
        info!(role = %name, username = %username, ttl_seconds = ttl.as_secs(), "Issued dynamic credentials");

        Ok(Lease {
            role: name.to_string(),
            db_name: role.db_name,
            username,
            password,
            ttl,
            expires_at,
        })
    }

    /// Drop a principal minted for dynamic role `name`
    pub async fn revoke_credentials(&self, technology: &str, name: &str, username: &str) -> Result<()> {
        let technology = self.technology(technology)?;
        let role = self.read_dynamic(technology, name).await?;
        let request = DeletePrincipal {
            username: username.to_string(),
            statements: role.statements.revocation.clone(),
        };
        self.resolver
            .call(&role.db_name, "delete_principal", |backend| async move {
                backend.delete_principal(request).await
            })
            .await?;

        self.metrics.record_credentials_revoked(technology);
        info!(role = %name, username = %username, "Revoked dynamic credentials");
        Ok(())
    }

    // Static roles

    /// Create or update a static role.
    ///
    /// A new role has its password rotated before the write returns; if that
    /// fails the record is removed again and the error returned.
    pub async fn write_static(
        &self,
        technology: &str,
        name: &str,
        request: StaticRoleRequest,
    ) -> Result<StaticRoleStatus> {
        let technology = self.technology(technology)?;
        validate_name(name, "role name")?;
        request.validate()?;
        self.check_policy(request.password_policy.as_deref())?;
        self.check_binding(technology, name, &request.db_name).await?;

        let key = StaticRoleKey::new(technology, name);
        let password_policy = request.password_policy.filter(|p| !p.is_empty());

        if let Some(mut role) = self.roles.get_static(&key).await? {
            if role.account.username != request.username {
                return Err(DbSecretsError::validation_field(
                    "username of an existing static role cannot be changed",
                    "username",
                ));
            }
            role.db_name = request.db_name;
            role.rotation_statements = request.rotation_statements;
            role.credential_type = request.credential_type;
            role.account.rotation_period_seconds = request.rotation_period_seconds;
            role.account.revoke_on_delete = request.revoke_on_delete;
            role.account.password_policy = password_policy;
            self.roles.put_static(&key, &role).await?;
            info!(role = %key, "Static role updated");
            return Ok(self.status(&key, &role));
        }

        let role = StaticRole {
            db_name: request.db_name,
            rotation_statements: request.rotation_statements,
            credential_type: request.credential_type,
            account: StaticAccount {
                username: request.username,
                password: SecretString::default(),
                last_rotation: Utc::now(),
                rotation_period_seconds: request.rotation_period_seconds,
                revoke_on_delete: request.revoke_on_delete,
                password_policy,
                failure_count: 0,
                last_failure: None,
                last_error: None,
            },
        };
        self.roles.put_static(&key, &role).await?;

        if let Err(e) = self.engine.rotate_now(&key).await {
            warn!(role = %key, error = %e, "Initial rotation failed; removing static role");
            if let Err(cleanup) = self.roles.delete_static(&key).await {
                warn!(role = %key, error = %cleanup, "Failed to remove static role after initial rotation");
            }
            return Err(e);
        }

        info!(role = %key, username = %role.account.username, "Static role created");
        let stored = self.load_static(&key).await?;
        Ok(self.status(&key, &stored))
    }

    async fn load_static(&self, key: &StaticRoleKey) -> Result<StaticRole> {
        self.roles
            .get_static(key)
            .await?
            .ok_or_else(|| DbSecretsError::not_found("Static role", key.to_string()))
    }

    fn status(&self, key: &StaticRoleKey, role: &StaticRole) -> StaticRoleStatus {
        let now = Utc::now();
        let state = if self.engine.is_in_flight(key) {
            RotationState::RotationInFlight
        } else {
            state_of(&role.account, now)
        };
        let account = &role.account;
        StaticRoleStatus {
            db_name: role.db_name.clone(),
            username: account.username.clone(),
            rotation_period_seconds: account.rotation_period_seconds,
            rotation_statements: role.rotation_statements.clone(),
            revoke_on_delete: account.revoke_on_delete,
            password_policy: account.password_policy.clone(),
            credential_type: role.credential_type,
            last_rotation: account.last_rotation,
            next_rotation: account.next_rotation_time(),
            ttl_seconds: account.ttl(now).num_seconds().max(0),
            state: state.to_string(),
            failure_count: account.failure_count,
            last_failure: account.last_failure,
            last_error: account.last_error.clone(),
        }
    }

    pub async fn read_static(&self, technology: &str, name: &str) -> Result<StaticRoleStatus> {
        let technology = self.technology(technology)?;
        let key = StaticRoleKey::new(technology, name);
        let role = self.load_static(&key).await?;
        Ok(self.status(&key, &role))
    }

    /// Current username and password of a static account
    pub async fn static_credentials(&self, technology: &str, name: &str) -> Result<StaticCredentials> {
        let technology = self.technology(technology)?;
        let role = self.load_static(&StaticRoleKey::new(technology, name)).await?;
        let ttl_seconds = role.account.ttl(Utc::now()).num_seconds().max(0);
        Ok(StaticCredentials {
            username: role.account.username,
            password: role.account.password,
            last_rotation: role.account.last_rotation,
            ttl_seconds,
        })
    }

    pub async fn list_static(&self, technology: &str) -> Result<Vec<String>> {
        let technology = self.technology(technology)?;
        self.roles.list_static(technology).await
    }

    /// Delete a static role; revoke-on-delete drops the principal first and
    /// keeps the record when that fails
    pub async fn delete_static(&self, technology: &str, name: &str) -> Result<()> {
        let technology = self.technology(technology)?;
        let key = StaticRoleKey::new(technology, name);
        let Some(role) = self.roles.get_static(&key).await? else {
            return Ok(());
        };

        if role.account.revoke_on_delete {
            let request = DeletePrincipal { username: role.account.username.clone(), statements: Vec::new() };
            self.resolver
                .call(&role.db_name, "delete_principal", |backend| async move {
                    backend.delete_principal(request).await
                })
                .await?;
            info!(role = %key, username = %role.account.username, "Revoked static account");
        }

        self.roles.delete_static(&key).await?;
        info!(role = %key, "Static role deleted");
        Ok(())
    }

    /// Manual rotation trigger
    pub async fn rotate_static(&self, technology: &str, name: &str) -> Result<StaticRoleStatus> {
        let technology = self.technology(technology)?;
        let key = StaticRoleKey::new(technology, name);
        self.engine.rotate_now(&key).await?;
        let role = self.load_static(&key).await?;
        Ok(self.status(&key, &role))
    }
}

/// `v-<role>-<random>-<unix>` cut to fit `max_len`.
///
/// The role part is shortened first, then the timestamp dropped, then the
/// random part trimmed, so short limits still get as much entropy as fits.
pub fn generate_username(role: &str, max_len: usize) -> String {
    let role: String = role.chars().take(USERNAME_ROLE_LEN).collect();
    let random: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(USERNAME_RANDOM_LEN).map(char::from).collect();
    let unix = Utc::now().timestamp();

    let full = format!("v-{}-{}-{}", role, random, unix);
    if full.len() <= max_len {
        return full;
    }

    let without_time = format!("v-{}-{}", role, random);
    if without_time.len() <= max_len {
        return without_time;
    }

    let mut short = format!("v-{}", random);
    short.truncate(max_len);
    short
}
