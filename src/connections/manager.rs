//! Connection manager
//!
//! Caches one live [`CredentialBackend`] per connection name. The map lock is
//! a synchronous `RwLock` and is never held across an await, so backend I/O
//! (connect, principal calls, close) always runs outside it.

use crate::engines::CredentialBackend;
use crate::errors::{DbSecretsError, Result};
use crate::observability::MetricsRecorder;
use crate::storage::{keys, KeyChange};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds racing an eviction are retried this many times before giving up
const MAX_BUILD_ATTEMPTS: usize = 3;

#[derive(Default)]
struct Slots {
    backends: HashMap<String, Arc<dyn CredentialBackend>>,
    /// Bumped by `evict(name)`; a build that straddles a bump is stale
    generations: HashMap<String, u64>,
    /// Bumped by `evict_all`
    epoch: u64,
}

impl Slots {
    fn stamp(&self, name: &str) -> (u64, u64) {
        (self.epoch, self.generations.get(name).copied().unwrap_or(0))
    }
}

/// Cache of live credential backends keyed by connection name
pub struct ConnectionManager {
    slots: RwLock<Slots>,
    metrics: MetricsRecorder,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager").field("names", &self.names()).finish()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(MetricsRecorder::new())
    }
}

impl ConnectionManager {
    pub fn new(metrics: MetricsRecorder) -> Self {
        Self { slots: RwLock::new(Slots::default()), metrics }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached backend for `name`, if any
    pub fn get(&self, name: &str) -> Option<Arc<dyn CredentialBackend>> {
        self.read().backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().backends.contains_key(name)
    }

    /// Names of every cached backend, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().backends.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.read().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap in `backend` for `name` and hand back the previous instance.
    ///
    /// The previous backend is NOT closed here; the caller closes it once the
    /// lock is released.
    pub fn install(
        &self,
        name: &str,
        backend: Arc<dyn CredentialBackend>,
    ) -> Option<Arc<dyn CredentialBackend>> {
        let (previous, count) = {
            let mut slots = self.write();
            let previous = slots.backends.insert(name.to_string(), backend);
            (previous, slots.backends.len())
        };
        self.metrics.set_cached_backends(count);
        debug!(connection = %name, replaced = previous.is_some(), "Installed credential backend");
        previous
    }

    /// Install `backend` and close whatever it replaced
    pub async fn replace(&self, name: &str, backend: Arc<dyn CredentialBackend>) {
        if let Some(previous) = self.install(name, backend.clone()) {
            if !Arc::ptr_eq(&previous, &backend) {
                self.metrics.record_backend_evicted("replaced");
                previous.close().await;
            }
        }
    }

    /// Remove and close the backend cached for `name`; no-op when absent
    pub async fn evict(&self, name: &str) {
        self.evict_with_reason(name, "explicit").await;
    }

    pub async fn evict_with_reason(&self, name: &str, reason: &str) {
        let (removed, count) = {
            let mut slots = self.write();
            *slots.generations.entry(name.to_string()).or_insert(0) += 1;
            let removed = slots.backends.remove(name);
            (removed, slots.backends.len())
        };

        if let Some(backend) = removed {
            self.metrics.record_backend_evicted(reason);
            self.metrics.set_cached_backends(count);
            backend.close().await;
            info!(connection = %name, reason = %reason, "Evicted credential backend");
        }
    }

    /// Evict `name` only while `backend` is still the cached instance.
    ///
    /// Returns false when `backend` had already been replaced or evicted.
    pub async fn evict_if_current(
        &self,
        name: &str,
        backend: &Arc<dyn CredentialBackend>,
        reason: &str,
    ) -> bool {
        let (removed, count) = {
            let mut slots = self.write();
            if !slots.backends.get(name).is_some_and(|cached| Arc::ptr_eq(cached, backend)) {
                return false;
            }
            *slots.generations.entry(name.to_string()).or_insert(0) += 1;
            (slots.backends.remove(name), slots.backends.len())
        };

        if let Some(backend) = removed {
            self.metrics.record_backend_evicted(reason);
            self.metrics.set_cached_backends(count);
            backend.close().await;
            info!(connection = %name, reason = %reason, "Evicted credential backend");
        }
        true
    }

    /// Close and remove every cached backend
    pub async fn evict_all(&self) {
        let drained: Vec<(String, Arc<dyn CredentialBackend>)> = {
            let mut slots = self.write();
            slots.epoch += 1;
            slots.backends.drain().collect()
        };
        self.metrics.set_cached_backends(0);

        let count = drained.len();
        for (name, backend) in drained {
            self.metrics.record_backend_evicted("evict_all");
            backend.close().await;
            debug!(connection = %name, "Closed credential backend");
        }
        if count > 0 {
            info!(count, "Evicted all credential backends");
        }
    }

    /// Cached backend for `name`, building and installing one when absent.
    ///
    /// `build` runs without the lock held. When two callers race on the same
    /// absent name the first install wins and the losing candidate is closed.
    /// A candidate built while `name` was being evicted is discarded and the
    /// build retried, so a stale configuration is never cached.
    pub async fn get_or_build<F, Fut>(&self, name: &str, build: F) -> Result<Arc<dyn CredentialBackend>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<dyn CredentialBackend>>>,
    {
        for _ in 0..MAX_BUILD_ATTEMPTS {
            let stamp = {
                let slots = self.read();
                if let Some(backend) = slots.backends.get(name) {
                    return Ok(backend.clone());
                }
                slots.stamp(name)
            };

            let candidate = build().await?;
            self.metrics.record_backend_built(candidate.technology());

            enum Outcome {
                Installed(usize),
                Lost(Arc<dyn CredentialBackend>),
                Stale,
            }

            let outcome = {
                let mut slots = self.write();
                if let Some(existing) = slots.backends.get(name) {
                    Outcome::Lost(existing.clone())
                } else if slots.stamp(name) != stamp {
                    Outcome::Stale
                } else {
                    slots.backends.insert(name.to_string(), candidate.clone());
                    Outcome::Installed(slots.backends.len())
                }
            };

            match outcome {
                Outcome::Installed(count) => {
                    self.metrics.set_cached_backends(count);
                    debug!(connection = %name, technology = candidate.technology(), "Cached new credential backend");
                    return Ok(candidate);
                }
                Outcome::Lost(existing) => {
                    debug!(connection = %name, "Concurrent build won; discarding candidate");
                    candidate.close().await;
                    return Ok(existing);
                }
                Outcome::Stale => {
                    debug!(connection = %name, "Connection invalidated during build; rebuilding");
                    candidate.close().await;
                }
            }
        }

        Err(DbSecretsError::internal(format!(
            "Connection '{}' kept changing while its backend was being built",
            name
        )))
    }

    /// Evict cached backends whose configuration key changes.
    ///
    /// A lagging receiver has missed notifications, so everything is evicted.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<KeyChange>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("Connection invalidation listener started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if let Some(name) = keys::connection_name_from_key(&change.key) {
                                manager.evict_with_reason(name, "invalidated").await;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Invalidation feed lagged; evicting all backends");
                            manager.evict_all().await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("Invalidation feed closed");
                            break;
                        }
                    }
                }
            }
            info!("Connection invalidation listener stopped");
        })
    }
}
