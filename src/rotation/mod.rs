//! # Static Account Rotation
//!
//! Per-account rotation state machine. An account is `Current` until its
//! next rotation time passes, then `Due`; an attempt moves it through
//! `RotationInFlight` back to `Current`, or records a failure and leaves
//! `last_rotation` untouched so the next pass retries it.
//!
//! At most one attempt runs per account. A second trigger for an account
//! that is already rotating is suppressed, not queued.

pub mod scheduler;

pub use scheduler::spawn_scheduler;

use crate::connections::BackendResolver;
use crate::engines::UpdatePrincipal;
use crate::errors::{DbSecretsError, Result};
use crate::observability::MetricsRecorder;
use crate::roles::{RoleStore, Schedule, StaticAccount, StaticRole, StaticRoleKey};
use crate::rotation_span;
use crate::secrets::{PasswordGenerator, SecretString};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Observable rotation state of one static account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Current,
    Due,
    RotationInFlight,
    /// The last attempt failed but the account is not yet due again
    Failed,
}

impl RotationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Due => "due",
            Self::RotationInFlight => "rotation_in_flight",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one rotation trigger
#[derive(Debug)]
pub enum RotationOutcome {
    Rotated { at: DateTime<Utc> },
    /// Scheduled trigger for an account that is still current
    NotDue,
    /// Another attempt for the same account was already running
    Suppressed,
    /// The attempt failed and the failure was recorded on the account
    Failed(DbSecretsError),
}

impl RotationOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Rotated { .. } => "rotated",
            Self::NotDue => "not_due",
            Self::Suppressed => "suppressed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Tally of one evaluation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub evaluated: usize,
    pub due: usize,
    pub rotated: usize,
    pub failed: usize,
    pub suppressed: usize,
}

/// Removes the account from the in-flight set when the attempt ends,
/// including when the attempt future is dropped
struct FlightGuard<'a> {
    in_flight: &'a DashMap<StaticRoleKey, ()>,
    key: StaticRoleKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

#[derive(Debug)]
pub struct RotationEngine {
    roles: RoleStore,
    resolver: BackendResolver,
    passwords: Arc<dyn PasswordGenerator>,
    in_flight: DashMap<StaticRoleKey, ()>,
    max_concurrent: usize,
    metrics: MetricsRecorder,
}

impl RotationEngine {
    pub fn new(
        roles: RoleStore,
        resolver: BackendResolver,
        passwords: Arc<dyn PasswordGenerator>,
        max_concurrent: usize,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            roles,
            resolver,
            passwords,
            in_flight: DashMap::new(),
            max_concurrent: max_concurrent.max(1),
            metrics,
        }
    }

    fn try_begin(&self, key: &StaticRoleKey) -> Option<FlightGuard<'_>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(FlightGuard { in_flight: &self.in_flight, key: key.clone() })
            }
        }
    }

    pub fn is_in_flight(&self, key: &StaticRoleKey) -> bool {
        self.in_flight.contains_key(key)
    }

    async fn load(&self, key: &StaticRoleKey) -> Result<StaticRole> {
        self.roles
            .get_static(key)
            .await?
            .ok_or_else(|| DbSecretsError::not_found("Static role", key.to_string()))
    }

    /// Current state of one account, recomputed against the wall clock
    pub async fn evaluate(&self, key: &StaticRoleKey) -> Result<RotationState> {
        if self.is_in_flight(key) {
            return Ok(RotationState::RotationInFlight);
        }
        let role = self.load(key).await?;
        Ok(state_of(&role.account, Utc::now()))
    }

    /// Rotate regardless of schedule.
    ///
    /// A failed attempt is recorded on the account and also returned as
    /// `RotationFailed`.
    pub async fn rotate_now(&self, key: &StaticRoleKey) -> Result<RotationOutcome> {
        match self.rotate(key, true).await? {
            RotationOutcome::Failed(e) => Err(DbSecretsError::rotation_failed(key.to_string(), e)),
            outcome => Ok(outcome),
        }
    }

    /// Rotate `key` if it is due (or unconditionally with `force`).
    ///
    /// Errors are returned only for failures to read the account itself;
    /// failures of the attempt are recorded and reported as
    /// [`RotationOutcome::Failed`].
    pub async fn rotate(&self, key: &StaticRoleKey, force: bool) -> Result<RotationOutcome> {
        let Some(_guard) = self.try_begin(key) else {
            debug!(account = %key, "Rotation already in flight; suppressing trigger");
            self.metrics.record_rotation_suppressed();
            return Ok(RotationOutcome::Suppressed);
        };

        let role = self.load(key).await?;
        let attempted_at = Utc::now();
        if !force && role.account.schedule(attempted_at) == Schedule::Current {
            return Ok(RotationOutcome::NotDue);
        }

        let span = rotation_span!(key, username = %role.account.username, connection = %role.db_name);
        let outcome = async {
            let started = Instant::now();
            let result = self.attempt(&role).await;
            let success = result.is_ok();
            self.metrics.record_rotation(&key.technology, success, started.elapsed().as_secs_f64());

            let outcome = match result {
                Ok(password) => {
                    self.persist(key, &role.account.username, |account| {
                        account.record_success(attempted_at, password)
                    })
                    .await;
                    info!(account = %key, "Rotated static account password");
                    RotationOutcome::Rotated { at: attempted_at }
                }
                Err(e) => {
                    let failure = DbSecretsError::rotation_failed(key.to_string(), e);
                    self.persist(key, &role.account.username, |account| {
                        account.record_failure(Utc::now(), &failure)
                    })
                    .await;
                    warn!(
                        account = %key,
                        failure_count = role.account.failure_count + 1,
                        error = %failure,
                        "Static account rotation failed"
                    );
                    RotationOutcome::Failed(failure)
                }
            };
            tracing::Span::current().record("outcome", outcome.label());
            outcome
        }
        .instrument(span)
        .await;
        Ok(outcome)
    }

    async fn attempt(&self, role: &StaticRole) -> Result<SecretString> {
        let connection = self.resolver.load_config(&role.db_name).await?;
        let policy =
            role.account.password_policy.as_deref().or(connection.password_policy.as_deref());
        let password = self.passwords.generate(policy).await?;

        let request = UpdatePrincipal {
            username: role.account.username.clone(),
            password: password.clone(),
            statements: role.rotation_statements.clone(),
        };
        self.resolver
            .call(&role.db_name, "update_principal_secret", |backend| async move {
                backend.update_principal_secret(request).await
            })
            .await?;
        Ok(password)
    }

    /// Apply an outcome to the freshest copy of the record.
    ///
    /// Administrative writes may have landed while the attempt ran; only the
    /// rotation bookkeeping fields are changed here. A record deleted or
    /// re-pointed at another username in the meantime is left alone.
    async fn persist<F>(&self, key: &StaticRoleKey, username: &str, apply: F)
    where
        F: FnOnce(&mut StaticAccount),
    {
        let current = match self.roles.get_static(key).await {
            Ok(Some(role)) if role.account.username == username => role,
            Ok(_) => {
                warn!(account = %key, "Static role changed during rotation; outcome not recorded");
                return;
            }
            Err(e) => {
                error!(account = %key, error = %e, "Failed to reload static role after rotation");
                return;
            }
        };

        let mut updated = current;
        apply(&mut updated.account);
        if let Err(e) = self.roles.put_static(key, &updated).await {
            error!(account = %key, error = %e, "Failed to record rotation outcome");
        }
    }

    /// Rotate every due account with bounded concurrency
    pub async fn run_pass(&self) -> Result<PassSummary> {
        let keys = self.roles.all_static_keys().await?;
        let mut summary = PassSummary { evaluated: keys.len(), ..Default::default() };

        let mut outcomes = stream::iter(keys)
            .map(|key| async move {
                let outcome = self.rotate(&key, false).await;
                (key, outcome)
            })
            .buffer_unordered(self.max_concurrent);

        while let Some((key, outcome)) = outcomes.next().await {
            match outcome {
                Ok(RotationOutcome::Rotated { .. }) => {
                    summary.due += 1;
                    summary.rotated += 1;
                }
                Ok(RotationOutcome::Failed(_)) => {
                    summary.due += 1;
                    summary.failed += 1;
                }
                Ok(RotationOutcome::Suppressed) => summary.suppressed += 1,
                Ok(RotationOutcome::NotDue) => {}
                Err(DbSecretsError::NotFound { .. }) => {
                    debug!(account = %key, "Static role removed during pass");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(account = %key, error = %e, "Failed to evaluate static role");
                }
            }
        }

        self.metrics.record_rotation_pass(summary.due, summary.failed);
        Ok(summary)
    }
}

/// State of an account that is not being rotated right now
pub fn state_of(account: &StaticAccount, now: DateTime<Utc>) -> RotationState {
    match account.schedule(now) {
        Schedule::Due => RotationState::Due,
        Schedule::Current if account.failure_count > 0 => RotationState::Failed,
        Schedule::Current => RotationState::Current,
    }
}
