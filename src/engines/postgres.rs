//! PostgreSQL credential backend.

use super::registry::ConnectionDetails;
use super::sql::{classify_sqlx_error, sanitize_url, with_timeout, PoolSlot, SqlConnectionSettings};
use super::template::{render_statements, validate_principal_name, Dialect};
use super::{ConnectionHandle, CredentialBackend, DeletePrincipal, NewPrincipal, UpdatePrincipal};
use crate::errors::{DbSecretsError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{PgPool, Postgres};
use std::str::FromStr;
use tracing::{debug, info, instrument};

const DEFAULT_CREATION: &str = r#"CREATE ROLE "{{name}}" WITH LOGIN PASSWORD '{{password}}'"#;
const DEFAULT_CREATION_EXPIRING: &str =
    r#"CREATE ROLE "{{name}}" WITH LOGIN PASSWORD '{{password}}' VALID UNTIL '{{expiration}}'"#;
const DEFAULT_ROTATION: &str = r#"ALTER ROLE "{{name}}" WITH PASSWORD '{{password}}'"#;
const DEFAULT_REVOCATION: &str = r#"DROP ROLE IF EXISTS "{{name}}""#;

/// NAMEDATALEN - 1
pub const MAX_USERNAME_LEN: usize = 63;

#[derive(Debug)]
pub struct PostgresBackend {
    settings: SqlConnectionSettings,
    options: PgConnectOptions,
    target: String,
    pool: PoolSlot<Postgres>,
}

impl PostgresBackend {
    pub const TECHNOLOGY: &'static str = "postgres";

    pub fn new(details: &ConnectionDetails) -> Result<Self> {
        let settings = SqlConnectionSettings::decode(details)?;

        match settings.scheme().as_deref() {
            Some("postgres") | Some("postgresql") => {}
            _ => {
                return Err(DbSecretsError::invalid_config_field(
                    "connection_url must be a postgres:// URL",
                    "connection_url",
                ))
            }
        }

        let url = settings.render_url();
        let target = sanitize_url(&url);

        let mut options = PgConnectOptions::from_str(&url).map_err(|e| {
            DbSecretsError::invalid_config_field(
                format!("Invalid connection_url {}: {}", target, e),
                "connection_url",
            )
        })?;

        if !settings.is_templated() {
            if let Some(username) = &settings.username {
                options = options.username(username);
            }
            if let Some(password) = &settings.password {
                options = options.password(password.expose_secret());
            }
        }

        let tls = &settings.tls;
        if tls.skip_verify {
            options = options.ssl_mode(PgSslMode::Require);
        } else if tls.ca.is_some() {
            options = options.ssl_mode(PgSslMode::VerifyFull);
        }
        if let Some(ca) = &tls.ca {
            options = options.ssl_root_cert_from_pem(ca.as_bytes().to_vec());
        }
        if let (Some(cert), Some(key)) = (&tls.certificate, &tls.private_key) {
            options = options
                .ssl_client_cert_from_pem(cert.as_bytes())
                .ssl_client_key_from_pem(key.expose_secret().as_bytes());
        }

        Ok(Self { settings, options, target, pool: PoolSlot::default() })
    }

    async fn pool(&self) -> Result<PgPool> {
        let options = self.options.clone();
        let pool_options = self.settings.pool_options::<Postgres>();
        with_timeout(
            "postgres connect",
            self.settings.connect_timeout,
            self.pool.get_or_connect(&self.target, || pool_options.connect_with(options)),
        )
        .await
    }

    async fn principal_exists(&self, pool: &PgPool, username: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_catalog.pg_roles WHERE rolname = $1)")
            .bind(username)
            .fetch_one(pool)
            .await
            .map_err(|e| classify_sqlx_error(e, &self.target, "lookup principal"))
    }

    /// Run all statements in one transaction
    async fn execute(&self, pool: &PgPool, operation: &str, statements: &[String]) -> Result<()> {
        let classify = |e: sqlx::Error| classify_sqlx_error(e, &self.target, operation);
        let mut tx = pool.begin().await.map_err(classify)?;
        for statement in statements {
            sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement)).await.map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    fn statements_or(statements: &[String], default: &str) -> Vec<String> {
        if statements.iter().all(|s| s.trim().is_empty()) {
            vec![default.to_string()]
        } else {
            statements.to_vec()
        }
    }
}

#[async_trait]
impl CredentialBackend for PostgresBackend {
    fn technology(&self) -> &'static str {
        Self::TECHNOLOGY
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        Ok(ConnectionHandle::Postgres(self.pool().await?))
    }

    #[instrument(skip(self, request), fields(connection = %self.target, username = %request.username))]
    async fn create_principal(&self, request: NewPrincipal) -> Result<()> {
        validate_principal_name(&request.username, MAX_USERNAME_LEN)?;
        let pool = self.pool().await?;
        let expiration = request.expiration.map(|t| t.format("%Y-%m-%d %H:%M:%S%:z").to_string());
        let default = if expiration.is_some() { DEFAULT_CREATION_EXPIRING } else { DEFAULT_CREATION };
        let statements = render_statements(
            Dialect::Postgres,
            &Self::statements_or(&request.statements, default),
            &request.username,
            Some(request.password.expose_secret()),
            expiration.as_deref(),
        );
        with_timeout(
            "postgres create_principal",
            self.settings.operation_timeout,
            self.execute(&pool, "create_principal", &statements),
        )
        .await?;
        info!(username = %request.username, "Created PostgreSQL role");
        Ok(())
    }

    #[instrument(skip(self, request), fields(connection = %self.target, username = %request.username))]
    async fn update_principal_secret(&self, request: UpdatePrincipal) -> Result<()> {
        validate_principal_name(&request.username, MAX_USERNAME_LEN)?;
        let pool = self.pool().await?;
        with_timeout("postgres update_principal_secret", self.settings.operation_timeout, async {
            if !self.principal_exists(&pool, &request.username).await? {
                return Err(DbSecretsError::principal_not_found(&request.username));
            }
            let statements = render_statements(
                Dialect::Postgres,
                &Self::statements_or(&request.statements, DEFAULT_ROTATION),
                &request.username,
                Some(request.password.expose_secret()),
                None,
            );
            self.execute(&pool, "update_principal_secret", &statements).await
        })
        .await?;
        debug!(username = %request.username, "Rotated PostgreSQL role password");
        Ok(())
    }

    #[instrument(skip(self, request), fields(connection = %self.target, username = %request.username))]
    async fn delete_principal(&self, request: DeletePrincipal) -> Result<()> {
        validate_principal_name(&request.username, MAX_USERNAME_LEN)?;
        let pool = self.pool().await?;
        with_timeout("postgres delete_principal", self.settings.operation_timeout, async {
            if !self.principal_exists(&pool, &request.username).await? {
                debug!(username = %request.username, "Role already absent");
                return Ok(());
            }
            let statements = render_statements(
                Dialect::Postgres,
                &Self::statements_or(&request.statements, DEFAULT_REVOCATION),
                &request.username,
                None,
                None,
            );
            self.execute(&pool, "delete_principal", &statements).await
        })
        .await?;
        info!(username = %request.username, "Dropped PostgreSQL role");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!(target_db = %self.target, "Closed PostgreSQL backend");
    }

    fn max_username_len(&self) -> usize {
        MAX_USERNAME_LEN
    }
}
