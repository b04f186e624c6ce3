//! # Credential Backends
//!
//! One [`CredentialBackend`] implementation per database technology, built
//! through the [`BackendRegistry`] from a connection's raw option bag.
//!
//! Backends are stateful: each owns at most one connection pool plus the
//! settings it was constructed from. The pool is created lazily by
//! [`CredentialBackend::connect`], so constructing a backend performs no
//! network I/O.

pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod sql;
pub mod template;

pub use mysql::MySqlBackend;
pub use postgres::PostgresBackend;
pub use registry::{BackendConstructor, BackendRegistry, ConnectionDetails};

use crate::errors::Result;
use crate::secrets::SecretString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, MySqlPool, PgPool};
use std::fmt;
use std::str::FromStr;

/// Kind of credential a role hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    #[default]
    Password,
    RsaPrivateKey,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::RsaPrivateKey => "rsa_private_key",
        }
    }
}

impl FromStr for CredentialType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "password" => Ok(Self::Password),
            "rsa_private_key" => Ok(Self::RsaPrivateKey),
            _ => Err(format!("Unknown credential type: {}", s)),
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Live pooled handle returned by [`CredentialBackend::connect`].
///
/// Pools are reference counted, so a handle stays usable while the backend
/// keeps its own copy; closing the backend closes every clone.
#[derive(Debug, Clone)]
pub enum ConnectionHandle {
    MySql(MySqlPool),
    Postgres(PgPool),
}

impl ConnectionHandle {
    pub fn technology(&self) -> &'static str {
        match self {
            Self::MySql(_) => MySqlBackend::TECHNOLOGY,
            Self::Postgres(_) => PostgresBackend::TECHNOLOGY,
        }
    }

    /// Round-trip to the server on a pooled connection
    pub async fn ping(&self) -> std::result::Result<(), sqlx::Error> {
        match self {
            Self::MySql(pool) => {
                let mut conn = pool.acquire().await?;
                conn.ping().await
            }
            Self::Postgres(pool) => {
                let mut conn = pool.acquire().await?;
                conn.ping().await
            }
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Self::MySql(pool) => pool.size(),
            Self::Postgres(pool) => pool.size(),
        }
    }

    pub fn num_idle(&self) -> usize {
        match self {
            Self::MySql(pool) => pool.num_idle(),
            Self::Postgres(pool) => pool.num_idle(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::MySql(pool) => pool.is_closed(),
            Self::Postgres(pool) => pool.is_closed(),
        }
    }
}

/// Create a principal that does not exist yet
#[derive(Debug, Clone)]
pub struct NewPrincipal {
    pub username: String,
    pub password: SecretString,
    /// Creation statements; empty selects the backend's defaults
    pub statements: Vec<String>,
    /// Expiry passed to templates as `{{expiration}}`
    pub expiration: Option<DateTime<Utc>>,
}

/// Replace the secret of an existing principal
#[derive(Debug, Clone)]
pub struct UpdatePrincipal {
    pub username: String,
    pub password: SecretString,
    /// Rotation statements; empty selects the backend's defaults
    pub statements: Vec<String>,
}

/// Remove a principal
#[derive(Debug, Clone)]
pub struct DeletePrincipal {
    pub username: String,
    /// Revocation statements; empty selects the backend's defaults
    pub statements: Vec<String>,
}

/// Capability contract every database technology implements.
///
/// Every method may block on the network. Callers bound them with a deadline
/// and must never hold a cache lock while awaiting one; dropping the future
/// cancels the call.
#[async_trait]
pub trait CredentialBackend: Send + Sync + fmt::Debug {
    /// Canonical technology name this backend was registered under
    fn technology(&self) -> &'static str;

    /// Return a live pooled handle, pinging a cached pool first and
    /// rebuilding it when the ping fails.
    async fn connect(&self) -> Result<ConnectionHandle>;

    /// Create a principal. Callers guarantee the username is unique.
    async fn create_principal(&self, request: NewPrincipal) -> Result<()>;

    /// Rotate an existing principal's secret; fails with `PrincipalNotFound`
    /// rather than creating it.
    async fn update_principal_secret(&self, request: UpdatePrincipal) -> Result<()>;

    /// Delete a principal. Absent principals are not an error.
    async fn delete_principal(&self, request: DeletePrincipal) -> Result<()>;

    /// Release the pool. Idempotent; failures are logged, never returned.
    async fn close(&self);

    fn supported_credential_types(&self) -> &'static [CredentialType] {
        &[CredentialType::Password]
    }

    /// Longest username the database accepts
    fn max_username_len(&self) -> usize;
}
