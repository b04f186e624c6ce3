//! # Metrics Collection
//!
//! Prometheus metrics for backend caching, credential issuance and rotation.
//! Recording is a no-op until a recorder is installed by [`init_metrics`].

use crate::config::ObservabilityConfig;
use crate::errors::{DbSecretsError, Result};
use ::tracing::{info, warn};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics recorder that tracks application metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one rotation attempt
    pub fn record_rotation(&self, technology: &str, success: bool, duration: f64) {
        let status = if success { "success" } else { "error" };
        let labels = [("technology", technology.to_string()), ("status", status.to_string())];
        counter!("rotations_total", &labels).increment(1);

        let duration_labels = [("technology", technology.to_string())];
        histogram!("rotation_duration_seconds", &duration_labels).record(duration);
    }

    /// Record a rotation attempt suppressed because another was in flight
    pub fn record_rotation_suppressed(&self) {
        counter!("rotations_suppressed_total").increment(1);
    }

    /// Record a finished evaluation pass
    pub fn record_rotation_pass(&self, due: usize, failed: usize) {
        counter!("rotation_passes_total").increment(1);
        gauge!("rotation_last_pass_due").set(due as f64);
        gauge!("rotation_last_pass_failed").set(failed as f64);
    }

    /// Record a backend constructed through the registry
    pub fn record_backend_built(&self, technology: &str) {
        let labels = [("technology", technology.to_string())];
        counter!("backend_builds_total", &labels).increment(1);
    }

    /// Record a cached backend being evicted
    pub fn record_backend_evicted(&self, reason: &str) {
        let labels = [("reason", reason.to_string())];
        counter!("backend_evictions_total", &labels).increment(1);
    }

    /// Update the cached backend gauge
    pub fn set_cached_backends(&self, count: usize) {
        gauge!("backends_cached").set(count as f64);
    }

    /// Record credentials minted for a dynamic role
    pub fn record_credentials_issued(&self, technology: &str) {
        let labels = [("technology", technology.to_string())];
        counter!("credentials_issued_total", &labels).increment(1);
    }

    /// Record credentials revoked for a dynamic role
    pub fn record_credentials_revoked(&self, technology: &str) {
        let labels = [("technology", technology.to_string())];
        counter!("credentials_revoked_total", &labels).increment(1);
    }

    /// Describe every metric so the exporter renders HELP lines
    pub fn register_metrics(&self) {
        describe_counter!("rotations_total", "Static account rotation attempts by outcome");
        describe_histogram!(
            "rotation_duration_seconds",
            Unit::Seconds,
            "Duration of static account rotation attempts"
        );
        describe_counter!(
            "rotations_suppressed_total",
            "Rotation attempts skipped because one was already in flight"
        );
        describe_counter!("rotation_passes_total", "Completed rotation evaluation passes");
        describe_gauge!("rotation_last_pass_due", "Accounts found due in the last pass");
        describe_gauge!("rotation_last_pass_failed", "Accounts that failed in the last pass");
        describe_counter!("backend_builds_total", "Credential backends constructed");
        describe_counter!("backend_evictions_total", "Cached credential backends evicted");
        describe_gauge!("backends_cached", "Credential backends currently cached");
        describe_counter!("credentials_issued_total", "Dynamic credentials issued");
        describe_counter!("credentials_revoked_total", "Dynamic credentials revoked");
    }
}

/// Initialize metrics collection and Prometheus exporter
pub async fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        DbSecretsError::invalid_config(format!(
            "Invalid metrics bind address '{}': {}",
            metrics_addr, e
        ))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| {
            DbSecretsError::invalid_config(format!("Failed to initialize metrics exporter: {}", e))
        })?;

    MetricsRecorder::new().register_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Prometheus metrics exporter started"
    );

    Ok(())
}
