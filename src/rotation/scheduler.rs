//! Periodic driver for rotation passes.

use super::RotationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Run [`RotationEngine::run_pass`] every `period` until `shutdown` fires.
///
/// A pass that is running when shutdown is requested finishes first, so no
/// attempt is abandoned between the database write and the record update.
pub fn spawn_scheduler(
    engine: Arc<RotationEngine>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_seconds = period.as_secs(), "Rotation scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match engine.run_pass().await {
                        Ok(summary) if summary.due > 0 || summary.suppressed > 0 => {
                            info!(
                                evaluated = summary.evaluated,
                                due = summary.due,
                                rotated = summary.rotated,
                                failed = summary.failed,
                                suppressed = summary.suppressed,
                                "Rotation pass complete"
                            );
                        }
                        Ok(summary) => {
                            debug!(evaluated = summary.evaluated, "Rotation pass found nothing due");
                        }
                        Err(e) => error!(error = %e, "Rotation pass failed"),
                    }
                }
            }
        }

        info!("Rotation scheduler stopped");
    })
}
