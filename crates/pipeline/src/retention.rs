//! Retention sweep for terminal job records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clusterflow_core::Timestamp;
use clusterflow_db::{JobRegistry, RegistryError};
use tokio_util::sync::CancellationToken;

/// How often the sweeper runs.
const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// RetentionSweeper
// ---------------------------------------------------------------------------

/// Deletes `SUCCEEDED` and `FAILED` records once they are older than the
/// retention window. Non-terminal records are never touched.
pub struct RetentionSweeper {
    registry: Arc<dyn JobRegistry>,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(registry: Arc<dyn JobRegistry>, retention_days: u32) -> Self {
        Self {
            registry,
            retention: chrono::Duration::days(i64::from(retention_days)),
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(RETENTION_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retention sweeper cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_at(Utc::now()).await {
                        tracing::error!(error = %e, "Failed to purge expired job records");
                    }
                }
            }
        }
    }

    /// Purge records that were already terminal `retention` before `now`.
    pub async fn sweep_at(&self, now: Timestamp) -> Result<u64, RegistryError> {
        let cutoff = now - self.retention;
        let purged = self.registry.purge_terminal_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "Purged expired job records");
        }
        Ok(purged)
    }
}
