//! Stale-job reconciliation.
//!
//! A `SUBMITTED` record normally leaves that state when its completion event
//! arrives. If the event was never published, or the process that owned the
//! cluster went away, the record would stay `SUBMITTED` forever.
//! [`Reconciler`] periodically looks for such records and settles them from
//! the cluster manager's view of the cluster.
//!
//! Each record names the worker instance that owns its cluster. Only the
//! owner's manager can describe the cluster, so records owned by another
//! instance are left alone while that instance keeps heartbeating, and are
//! failed as lost once its heartbeat is older than `owner_ttl`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clusterflow_cluster::ClusterManager;
use clusterflow_core::{JobRecord, JobState, Timestamp};
use clusterflow_db::{JobRegistry, RegistryError};
use tokio_util::sync::CancellationToken;

use crate::completion::{CompletionError, CompletionHandler};

/// Records examined per sweep.
const SWEEP_BATCH_LIMIT: i64 = 100;

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    /// Cluster was terminal; the record was finalized from it.
    pub finalized: usize,
    /// Cluster unknown to the manager, or its owner stopped heartbeating;
    /// the record was failed.
    pub lost: usize,
    pub still_running: usize,
    /// Owned by another live instance; skipped.
    pub owned_elsewhere: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// This worker's instance id, as recorded on the records it submits.
    pub instance_id: String,
    pub interval: Duration,
    /// Age after which a `SUBMITTED` record is considered stale.
    pub stale_after: Duration,
    /// A heartbeat older than this marks its instance as gone.
    pub owner_ttl: Duration,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    registry: Arc<dyn JobRegistry>,
    clusters: Arc<ClusterManager>,
    completion: Arc<CompletionHandler>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        clusters: Arc<ClusterManager>,
        completion: Arc<CompletionHandler>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            clusters,
            completion,
            config,
        }
    }

    /// Heartbeat, prune finished clusters and sweep every `interval` until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciler cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        tracing::error!(error = %e, "Failed to record heartbeat");
                    }
                    self.clusters.prune_terminal().await;
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Failed to reconcile stale jobs");
                    }
                }
            }
        }
    }

    /// Record that this instance is alive.
    pub async fn heartbeat(&self) -> Result<(), RegistryError> {
        self.registry
            .heartbeat(&self.config.instance_id, Utc::now())
            .await
    }

    pub async fn sweep(&self) -> Result<ReconcileSummary, RegistryError> {
        let Some(cutoff) = ago(self.config.stale_after) else {
            return Ok(ReconcileSummary::default());
        };
        self.sweep_before(cutoff).await
    }

    /// Reconcile `SUBMITTED` records last updated before `cutoff`.
    pub async fn sweep_before(&self, cutoff: Timestamp) -> Result<ReconcileSummary, RegistryError> {
        let stale = self
            .registry
            .list_stale(JobState::Submitted, cutoff, SWEEP_BATCH_LIMIT)
            .await?;

        let mut summary = ReconcileSummary {
            examined: stale.len(),
            ..Default::default()
        };
        for record in &stale {
            if let Err(e) = self.reconcile(record, &mut summary).await {
                summary.errors += 1;
                tracing::error!(job_id = %record.job_id, error = %e, "Failed to reconcile job");
            }
        }

        if summary.examined > 0 {
            tracing::info!(
                examined = summary.examined,
                finalized = summary.finalized,
                lost = summary.lost,
                still_running = summary.still_running,
                owned_elsewhere = summary.owned_elsewhere,
                errors = summary.errors,
                "Reconciled stale jobs"
            );
        }
        Ok(summary)
    }

    async fn reconcile(
        &self,
        record: &JobRecord,
        summary: &mut ReconcileSummary,
    ) -> Result<(), CompletionError> {
        if let Some(owner) = record
            .owner_id
            .as_deref()
            .filter(|owner| *owner != self.config.instance_id)
        {
            if self.owner_alive(owner).await? {
                summary.owned_elsewhere += 1;
                return Ok(());
            }
            tracing::warn!(
                job_id = %record.job_id,
                cluster_id = ?record.cluster_id,
                owner,
                "Owning worker stopped heartbeating, failing job"
            );
            let error = format!("cluster lost: owner {owner} stopped heartbeating");
            self.completion.fail_job(record, &error).await?;
            summary.lost += 1;
            return Ok(());
        }

        let Some(cluster_id) = record.cluster_id.as_deref() else {
            self.completion
                .fail_job(record, "submitted without a cluster id")
                .await?;
            summary.lost += 1;
            return Ok(());
        };

        match self.clusters.describe(cluster_id).await {
            Some(handle) => match handle.completion_event() {
                Some(event) => {
                    tracing::warn!(
                        job_id = %record.job_id,
                        cluster_id,
                        state = %handle.state,
                        "Completion event missing for terminal cluster, finalizing"
                    );
                    self.completion.finalize(&event).await?;
                    summary.finalized += 1;
                }
                None => summary.still_running += 1,
            },
            None => {
                tracing::warn!(job_id = %record.job_id, cluster_id, "Cluster lost, failing job");
                self.completion.fail_job(record, "cluster lost").await?;
                summary.lost += 1;
            }
        }
        Ok(())
    }

    async fn owner_alive(&self, owner: &str) -> Result<bool, RegistryError> {
        let Some(last_seen) = self.registry.last_heartbeat(owner).await? else {
            return Ok(false);
        };
        Ok(ago(self.config.owner_ttl).map_or(true, |cutoff| last_seen >= cutoff))
    }
}

fn ago(age: Duration) -> Option<Timestamp> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}
