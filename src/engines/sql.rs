//! Shared plumbing for the SQL backends: option-bag decoding, URL
//! templating, error classification and the lazily built pool slot.

use super::registry::ConnectionDetails;
use super::template::render;
use crate::errors::{DbSecretsError, Result};
use crate::secrets::SecretString;
use serde_json::Value;
use sqlx::pool::{Pool, PoolOptions};
use sqlx::{Connection, Database};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_MAX_OPEN_CONNECTIONS: u32 = 4;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connections beyond `max_idle_connections` are reaped after this long
const IDLE_REAP_AFTER: Duration = Duration::from_secs(30);

/// TLS material for the database connection
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM CA bundle used to verify the server
    pub ca: Option<String>,
    /// PEM client certificate
    pub certificate: Option<String>,
    /// PEM client key
    pub private_key: Option<SecretString>,
    /// Encrypt without verifying the server certificate
    pub skip_verify: bool,
}

impl TlsSettings {
    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.certificate.is_some() || self.skip_verify
    }
}

/// Decoded, validated connection settings common to SQL technologies
#[derive(Debug, Clone)]
pub struct SqlConnectionSettings {
    pub connection_url: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub max_open_connections: u32,
    pub max_idle_connections: u32,
    /// `None` means connections live forever
    pub max_connection_lifetime: Option<Duration>,
    pub connect_timeout: Duration,
    /// Deadline for each principal-management call
    pub operation_timeout: Duration,
    pub tls: TlsSettings,
}

impl SqlConnectionSettings {
    /// Decode the raw option bag. Strings, numbers and booleans are accepted
    /// interchangeably where the meaning is unambiguous.
    pub fn decode(details: &ConnectionDetails) -> Result<Self> {
        let connection_url = get_string(details, &["connection_url"])?
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                DbSecretsError::invalid_config_field("connection_url is required", "connection_url")
            })?;

        let max_open_connections = match get_i64(details, "max_open_connections")? {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => DEFAULT_MAX_OPEN_CONNECTIONS,
        };

        let max_idle_connections = match get_i64(details, "max_idle_connections")? {
            Some(n) if n >= 0 && n <= i64::from(max_open_connections) => n as u32,
            _ => max_open_connections,
        };

        let max_connection_lifetime = get_duration(details, "max_connection_lifetime")?
            .filter(|d| !d.is_zero());

        let connect_timeout = get_duration(details, "connect_timeout")?
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let operation_timeout = get_duration(details, "operation_timeout")?
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT);

        let tls = TlsSettings {
            ca: get_string(details, &["tls_ca", "tls_ca_cert"])?,
            certificate: get_string(details, &["tls_certificate", "tls_client_cert"])?,
            private_key: get_string(details, &["tls_private_key", "tls_client_key"])?
                .map(SecretString::new),
            skip_verify: get_bool(details, "tls_skip_verify")?.unwrap_or(false),
        };

        if tls.certificate.is_some() != tls.private_key.is_some() {
            return Err(DbSecretsError::invalid_config(
                "tls_certificate and tls_private_key must be provided together",
            ));
        }

        Ok(Self {
            connection_url,
            username: get_string(details, &["username"])?,
            password: get_string(details, &["password"])?.map(SecretString::new),
            max_open_connections,
            max_idle_connections,
            max_connection_lifetime,
            connect_timeout,
            operation_timeout,
            tls,
        })
    }

    /// Whether the URL carries `{{username}}`/`{{password}}` placeholders
    pub fn is_templated(&self) -> bool {
        self.connection_url.contains("{{")
    }

    /// Connection URL with credentials percent-encoded into the placeholders
    pub fn render_url(&self) -> String {
        let username = self.username.as_deref().map(urlencoding::encode).unwrap_or_default();
        let password = self
            .password
            .as_ref()
            .map(|p| urlencoding::encode(p.expose_secret()))
            .unwrap_or_default();
        render(&self.connection_url, &[("username", &*username), ("password", &*password)])
    }

    /// A literal password in the URL rather than the `{{password}}` template
    pub fn url_embeds_password(&self) -> bool {
        url_embeds_password(&self.connection_url)
    }

    /// Scheme of the connection URL, lowercased
    pub fn scheme(&self) -> Option<String> {
        self.connection_url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase())
    }

    /// Apply pool sizing to sqlx pool options
    pub fn pool_options<DB: Database>(&self) -> PoolOptions<DB> {
        let idle_timeout = if self.max_idle_connections < self.max_open_connections {
            Some(IDLE_REAP_AFTER)
        } else {
            None
        };

        PoolOptions::<DB>::new()
            .max_connections(self.max_open_connections)
            .min_connections(0)
            .acquire_timeout(self.connect_timeout)
            .max_lifetime(self.max_connection_lifetime)
            .idle_timeout(idle_timeout)
    }
}

fn lookup<'a>(details: &'a ConnectionDetails, keys: &[&str]) -> Option<(&'a str, &'a Value)> {
    keys.iter()
        .find_map(|k| details.get_key_value(*k))
        .map(|(k, v)| (k.as_str(), v))
        .filter(|(_, v)| !v.is_null())
}

fn get_string(details: &ConnectionDetails, keys: &[&str]) -> Result<Option<String>> {
    match lookup(details, keys) {
        None => Ok(None),
        Some((_, Value::String(s))) if s.is_empty() => Ok(None),
        Some((_, Value::String(s))) => Ok(Some(s.clone())),
        Some((_, Value::Number(n))) => Ok(Some(n.to_string())),
        Some((_, Value::Bool(b))) => Ok(Some(b.to_string())),
        Some((key, _)) => Err(DbSecretsError::invalid_config_field(
            format!("{} must be a string", key),
            key,
        )),
    }
}

fn get_i64(details: &ConnectionDetails, key: &str) -> Result<Option<i64>> {
    let invalid = || DbSecretsError::invalid_config_field(format!("{} must be an integer", key), key);
    match lookup(details, &[key]) {
        None => Ok(None),
        Some((_, Value::Number(n))) => n.as_i64().map(Some).ok_or_else(invalid),
        Some((_, Value::String(s))) if s.trim().is_empty() => Ok(None),
        Some((_, Value::String(s))) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

fn get_bool(details: &ConnectionDetails, key: &str) -> Result<Option<bool>> {
    let invalid = || DbSecretsError::invalid_config_field(format!("{} must be a boolean", key), key);
    match lookup(details, &[key]) {
        None => Ok(None),
        Some((_, Value::Bool(b))) => Ok(Some(*b)),
        Some((_, Value::Number(n))) => Ok(Some(n.as_f64().is_some_and(|n| n != 0.0))),
        Some((_, Value::String(s))) => match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "t" | "true" => Ok(Some(true)),
            "0" | "f" | "false" => Ok(Some(false)),
            _ => Err(invalid()),
        },
        Some(_) => Err(invalid()),
    }
}

fn get_duration(details: &ConnectionDetails, key: &str) -> Result<Option<Duration>> {
    let invalid = |reason: String| {
        DbSecretsError::invalid_config_field(format!("invalid {}: {}", key, reason), key)
    };
    match lookup(details, &[key]) {
        None => Ok(None),
        Some((_, Value::Number(n))) => {
            let secs = n.as_f64().ok_or_else(|| invalid("not a number".to_string()))?;
            seconds_to_duration(secs).map(Some).map_err(invalid)
        }
        Some((_, Value::String(s))) if s.trim().is_empty() => Ok(None),
        Some((_, Value::String(s))) => parse_duration(s).map(Some).map_err(invalid),
        Some(_) => Err(invalid("expected seconds or a duration string".to_string())),
    }
}

fn seconds_to_duration(secs: f64) -> std::result::Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("{} is not a non-negative number of seconds", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{} seconds: {}", secs, e))
}

/// Parse plain seconds (`"300"`) or unit-suffixed durations such as
/// `"90s"`, `"5m"`, `"1h30m"` and `"250ms"`.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    if let Ok(secs) = input.parse::<f64>() {
        return seconds_to_duration(secs);
    }

    let mut total = 0f64;
    let mut rest = input;
    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in '{}'", input))?;
        if number_end == 0 {
            return Err(format!("expected a number in '{}'", input));
        }
        let value: f64 =
            rest[..number_end].parse().map_err(|_| format!("bad number in '{}'", input))?;
        rest = &rest[number_end..];

        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            unit => return Err(format!("unknown unit '{}'", unit)),
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }

    seconds_to_duration(total)
}

/// Whether `url` carries a literal password instead of `{{password}}`
pub fn url_embeds_password(url: &str) -> bool {
    !url.contains("{{password}}") && url::Url::parse(url).is_ok_and(|u| u.password().is_some())
}

/// Strip credentials from a URL before it is logged or put in an error
pub fn sanitize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.password().is_some() || !parsed.username().is_empty() => format!(
            "{}://***:***@{}{}{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("unknown"),
            parsed.port().map(|p| format!(":{}", p)).unwrap_or_default(),
            parsed.path()
        ),
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Map a driver error onto the backend error taxonomy
pub fn classify_sqlx_error(error: sqlx::Error, target: &str, operation: &str) -> DbSecretsError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Configuration(_) => {
            DbSecretsError::connect_failed_with_source(target, Box::new(error))
        }
        // Authentication failures surface as server errors during the handshake
        sqlx::Error::Database(db) if is_auth_failure(db.code().as_deref()) => {
            DbSecretsError::connect_failed(target, db.message().to_string())
        }
        other => DbSecretsError::backend_exec_with_source(operation, Box::new(other)),
    }
}

fn is_auth_failure(code: Option<&str>) -> bool {
    // MySQL ER_ACCESS_DENIED_ERROR / ER_DBACCESS_DENIED_ERROR, Postgres class 28
    matches!(code, Some("28000") | Some("28P01") | Some("1045") | Some("1044"))
}

/// Bound `future` by `limit`, mapping expiry to `Timeout`
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(DbSecretsError::timeout(operation, limit.as_millis() as u64)),
    }
}

/// Zero-or-one pool owned by a backend.
///
/// The slot lock serialises pool construction for one backend only; it is
/// unrelated to the connection cache lock. Health pings run outside it.
/// Once closed the slot never opens another pool.
#[derive(Debug)]
pub struct PoolSlot<DB: Database> {
    state: Mutex<SlotState<DB>>,
}

#[derive(Debug)]
struct SlotState<DB: Database> {
    pool: Option<Pool<DB>>,
    /// Bumped whenever a pool is installed or dropped
    generation: u64,
    closed: bool,
}

impl<DB: Database> Default for PoolSlot<DB> {
    fn default() -> Self {
        Self { state: Mutex::new(SlotState { pool: None, generation: 0, closed: false }) }
    }
}

fn slot_closed(target: &str) -> DbSecretsError {
    DbSecretsError::connect_failed(target, "backend has been closed")
}

impl<DB: Database> PoolSlot<DB> {
    /// Return the cached pool if it answers a ping, otherwise build a new one
    pub async fn get_or_connect<F, Fut>(&self, target: &str, build: F) -> Result<Pool<DB>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Pool<DB>, sqlx::Error>>,
    {
        let (cached, seen) = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(slot_closed(target));
            }
            (state.pool.clone(), state.generation)
        };

        if let Some(pool) = cached {
            match ping(&pool).await {
                Ok(()) => return Ok(pool),
                Err(e) => warn!(target_db = %target, error = %e, "Cached pool failed ping, reconnecting"),
            }
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(slot_closed(target));
        }
        if state.generation != seen {
            // Another caller already replaced the pool we saw
            if let Some(pool) = state.pool.clone() {
                return Ok(pool);
            }
        }
        if let Some(stale) = state.pool.take() {
            state.generation += 1;
            tokio::spawn(async move { stale.close().await });
        }

        let pool = build().await.map_err(|e| classify_sqlx_error(e, target, "connect"))?;
        if let Err(e) = ping(&pool).await {
            pool.close().await;
            return Err(classify_sqlx_error(e, target, "connect"));
        }

        debug!(target_db = %target, "Opened database pool");
        state.pool = Some(pool.clone());
        state.generation += 1;
        Ok(pool)
    }

    /// Close the pool, if any, and refuse to open another
    pub async fn close(&self) {
        let pool = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.generation += 1;
            state.pool.take()
        };
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    pub async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        !state.closed && state.pool.as_ref().is_some_and(|p| !p.is_closed())
    }
}

async fn ping<DB: Database>(pool: &Pool<DB>) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}
