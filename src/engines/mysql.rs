//! MySQL / MariaDB credential backend.

use super::registry::ConnectionDetails;
use super::sql::{classify_sqlx_error, sanitize_url, with_timeout, PoolSlot, SqlConnectionSettings};
use super::template::{render_statements, validate_principal_name, Dialect};
use super::{ConnectionHandle, CredentialBackend, DeletePrincipal, NewPrincipal, UpdatePrincipal};
use crate::errors::{DbSecretsError, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use sqlx::{MySql, MySqlPool};
use std::str::FromStr;
use tracing::{debug, info, instrument};

const DEFAULT_CREATION: &str = "CREATE USER '{{name}}'@'%' IDENTIFIED BY '{{password}}'";
const DEFAULT_ROTATION: &str = "ALTER USER '{{name}}'@'%' IDENTIFIED BY '{{password}}'";
const DEFAULT_REVOCATION: &str = "DROP USER IF EXISTS '{{name}}'@'%'";

/// MySQL 5.7+ limit on account names
pub const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug)]
pub struct MySqlBackend {
    settings: SqlConnectionSettings,
    options: MySqlConnectOptions,
    /// Credential-free URL for logs and errors
    target: String,
    pool: PoolSlot<MySql>,
}

impl MySqlBackend {
    pub const TECHNOLOGY: &'static str = "mysql";

    /// Decode and validate the option bag without touching the network
    pub fn new(details: &ConnectionDetails) -> Result<Self> {
        let settings = SqlConnectionSettings::decode(details)?;

        match settings.scheme().as_deref() {
            Some("mysql") | Some("mariadb") => {}
            _ => {
                return Err(DbSecretsError::invalid_config_field(
                    "connection_url must be a mysql:// URL",
                    "connection_url",
                ))
            }
        }

        let url = settings.render_url();
        let target = sanitize_url(&url);
        let options = Self::connect_options(&settings, &url)?;

        Ok(Self { settings, options, target, pool: PoolSlot::default() })
    }

    fn connect_options(settings: &SqlConnectionSettings, url: &str) -> Result<MySqlConnectOptions> {
        let mut options = MySqlConnectOptions::from_str(url).map_err(|e| {
            DbSecretsError::invalid_config_field(
                format!("Invalid connection_url {}: {}", sanitize_url(url), e),
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
            options = options.ssl_mode(MySqlSslMode::Required);
        } else if tls.ca.is_some() {
            options = options.ssl_mode(MySqlSslMode::VerifyCa);
        }
        if let Some(ca) = &tls.ca {
            options = options.ssl_ca_from_pem(ca.as_bytes().to_vec());
        }
        if let (Some(cert), Some(key)) = (&tls.certificate, &tls.private_key) {
            options = options
                .ssl_client_cert_from_pem(cert.as_bytes())
                .ssl_client_key_from_pem(key.expose_secret().as_bytes());
        }

        Ok(options)
    }

    async fn pool(&self) -> Result<MySqlPool> {
        let options = self.options.clone();
        let pool_options = self.settings.pool_options::<MySql>();
        with_timeout(
            "mysql connect",
            self.settings.connect_timeout,
            self.pool.get_or_connect(&self.target, || pool_options.connect_with(options)),
        )
        .await
    }

    async fn principal_exists(&self, pool: &MySqlPool, username: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mysql.user WHERE User = ?")
            .bind(username)
            .fetch_one(pool)
            .await
            .map_err(|e| classify_sqlx_error(e, &self.target, "lookup principal"))?;
        Ok(count > 0)
    }

    async fn execute(&self, pool: &MySqlPool, operation: &str, statements: &[String]) -> Result<()> {
        let mut conn =
            pool.acquire().await.map_err(|e| classify_sqlx_error(e, &self.target, operation))?;
        for statement in statements {
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(statement))
                .await
                .map_err(|e| classify_sqlx_error(e, &self.target, operation))?;
        }
        Ok(())
    }

    fn statements_or_default(statements: &[String], default: &str) -> Vec<String> {
        if statements.iter().all(|s| s.trim().is_empty()) {
            vec![default.to_string()]
        } else {
            statements.to_vec()
        }
    }
}

#[async_trait]
impl CredentialBackend for MySqlBackend {
    fn technology(&self) -> &'static str {
        Self::TECHNOLOGY
    }

    async fn connect(&self) -> Result<ConnectionHandle> {
        Ok(ConnectionHandle::MySql(self.pool().await?))
    }

    #[instrument(skip(self, request), fields(connection = %self.target, username = %request.username))]
    async fn create_principal(&self, request: NewPrincipal) -> Result<()> {
        validate_principal_name(&request.username, MAX_USERNAME_LEN)?;
        let pool = self.pool().await?;
        let expiration =
            request.expiration.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        let statements = render_statements(
            Dialect::MySql,
            &Self::statements_or_default(&request.statements, DEFAULT_CREATION),
            &request.username,
            Some(request.password.expose_secret()),
            expiration.as_deref(),
        );
        with_timeout(
            "mysql create_principal",
            self.settings.operation_timeout,
            self.execute(&pool, "create_principal", &statements),
        )
        .await?;
        info!(username = %request.username, "Created MySQL principal");
        Ok(())
    }

    #[instrument(skip(self, request), fields(connection = %self.target, username = %request.username))]
    async fn update_principal_secret(&self, request: UpdatePrincipal) -> Result<()> {
        validate_principal_name(&request.username, MAX_USERNAME_LEN)?;
        let pool = self.pool().await?;
        with_timeout("mysql update_principal_secret", self.settings.operation_timeout, async {
            if !self.principal_exists(&pool, &request.username).await? {
                return Err(DbSecretsError::principal_not_found(&request.username));
            }
            let statements = render_statements(
                Dialect::MySql,
                &Self::statements_or_default(&request.statements, DEFAULT_ROTATION),
                &request.username,
                Some(request.password.expose_secret()),
                None,
            );
            self.execute(&pool, "update_principal_secret", &statements).await
        })
        .await?;
        debug!(username = %request.username, "Rotated MySQL principal secret");
        Ok(())
    }

    #[instrument(skip(self, request), fields(connection = %self.target, username = %request.username))]
    async fn delete_principal(&self, request: DeletePrincipal) -> Result<()> {
        validate_principal_name(&request.username, MAX_USERNAME_LEN)?;
        let pool = self.pool().await?;
        with_timeout("mysql delete_principal", self.settings.operation_timeout, async {
            if !self.principal_exists(&pool, &request.username).await? {
                debug!(username = %request.username, "Principal already absent");
                return Ok(());
            }
            let statements = render_statements(
                Dialect::MySql,
                &Self::statements_or_default(&request.statements, DEFAULT_REVOCATION),
                &request.username,
                None,
                None,
            );
            self.execute(&pool, "delete_principal", &statements).await
        })
        .await?;
        info!(username = %request.username, "Deleted MySQL principal");
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        debug!(target_db = %self.target, "Closed MySQL backend");
    }

    fn max_username_len(&self) -> usize {
        MAX_USERNAME_LEN
    }
}
