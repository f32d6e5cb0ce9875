//! Cluster lifecycle manager.
//!
//! [`ClusterManager`] is created once at startup and shared as
//! `Arc<ClusterManager>`. `submit` is idempotent on the job id: a
//! resubmission returns the existing handle instead of creating a second
//! cluster. Each cluster is driven by its own task
//! (provision -> run steps in order -> release) under a maximum run duration
//! and a per-cluster cancellation token, and publishes exactly one
//! completion event when it reaches a terminal state. Terminal clusters stay
//! visible to `describe` for `terminal_retention`, then `prune_terminal`
//! evicts them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use clusterflow_core::cluster::{ClusterState, StepFailure, TerminationReason};
use clusterflow_core::job_spec::{FailurePolicy, JobSpec};
use clusterflow_core::messages::CompletionEvent;
use clusterflow_core::retry::RetryPolicy;
use clusterflow_core::{ClusterId, JobId};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ClusterBackend, SubmissionError};
use crate::handle::ClusterHandle;
use crate::publisher::CompletionPublisher;

/// How long `shutdown` waits for each cluster task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClusterManagerConfig {
    /// Bound on the cluster service's `create` call.
    pub submission_timeout: Duration,
    /// Clusters still running after this are failed with `TIMEOUT`.
    pub max_run_duration: Duration,
    /// Retries for publishing the completion event.
    pub publish_retry: RetryPolicy,
    /// How long a finished cluster stays queryable before eviction.
    pub terminal_retention: Duration,
}

impl Default for ClusterManagerConfig {
    fn default() -> Self {
        Self {
            submission_timeout: Duration::from_secs(30),
            max_run_duration: Duration::from_secs(3600),
            publish_retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
            },
            terminal_retention: Duration::from_secs(2 * 3600),
        }
    }
}

pub struct ClusterManager {
    backend: Arc<dyn ClusterBackend>,
    publisher: Arc<dyn CompletionPublisher>,
    config: ClusterManagerConfig,
    clusters: RwLock<HashMap<ClusterId, ManagedCluster>>,
    /// jobId -> clusterId, the idempotency index for `submit`.
    jobs: RwLock<HashMap<JobId, ClusterId>>,
    /// Per-job locks held while a `create` call is in flight.
    submit_locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
    /// Master token; every cluster token is a child of it.
    cancel: CancellationToken,
}

struct ManagedCluster {
    job_id: JobId,
    handle: Arc<RwLock<ClusterHandle>>,
    cancel: CancellationToken,
    /// Reason given to the first `terminate` call.
    requested: Arc<OnceLock<TerminationReason>>,
    /// Set by the cluster task once the completion event is out.
    finished: Arc<OnceLock<Instant>>,
    task: Option<JoinHandle<()>>,
}

impl ClusterManager {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        publisher: Arc<dyn CompletionPublisher>,
        config: ClusterManagerConfig,
    ) -> Self {
        Self {
            backend,
            publisher,
            config,
            clusters: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            submit_locks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Submit a job. Returns the existing handle if the job id already has a
    /// cluster.
    pub async fn submit(&self, spec: &JobSpec) -> Result<ClusterHandle, SubmissionError> {
        spec.validate()
            .map_err(|e| SubmissionError::Permanent(e.to_string()))?;
        if self.cancel.is_cancelled() {
            return Err(SubmissionError::Transient(
                "cluster manager is shutting down".into(),
            ));
        }

        self.prune_terminal().await;

        let job_lock = {
            let mut locks = self.submit_locks.lock().await;
            Arc::clone(locks.entry(spec.job_id.clone()).or_default())
        };
        let guard = job_lock.lock().await;
        let result = self.submit_locked(spec).await;
        drop(guard);
        self.submit_locks.lock().await.remove(&spec.job_id);
        result
    }

    async fn submit_locked(&self, spec: &JobSpec) -> Result<ClusterHandle, SubmissionError> {
        if let Some(existing) = self.handle_for_job(&spec.job_id).await {
            tracing::debug!(
                job_id = %spec.job_id,
                cluster_id = %existing.cluster_id,
                "Job already has a cluster, returning existing handle"
            );
            return Ok(existing);
        }

        let timeout = self.config.submission_timeout;
        let cluster_id = match tokio::time::timeout(timeout, self.backend.create(spec)).await {
            Ok(Ok(cluster_id)) => cluster_id,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(SubmissionError::Transient(format!(
                    "cluster service did not acknowledge within {}s",
                    timeout.as_secs_f64()
                )))
            }
        };

        let handle = ClusterHandle::provisioning(cluster_id.clone(), spec.job_id.clone());
        let shared = Arc::new(RwLock::new(handle.clone()));
        let cancel = self.cancel.child_token();
        let requested = Arc::new(OnceLock::new());
        let finished = Arc::new(OnceLock::new());

        let run = ClusterRun {
            backend: Arc::clone(&self.backend),
            publisher: Arc::clone(&self.publisher),
            handle: Arc::clone(&shared),
            spec: spec.clone(),
            cancel: cancel.clone(),
            requested: Arc::clone(&requested),
            finished: Arc::clone(&finished),
            max_run_duration: self.config.max_run_duration,
            publish_retry: self.config.publish_retry.clone(),
        };
        let task = tokio::spawn(run.drive());

        self.clusters.write().await.insert(
            cluster_id.clone(),
            ManagedCluster {
                job_id: spec.job_id.clone(),
                handle: shared,
                cancel,
                requested,
                finished,
                task: Some(task),
            },
        );
        self.jobs
            .write()
            .await
            .insert(spec.job_id.clone(), cluster_id.clone());

        tracing::info!(
            job_id = %spec.job_id,
            cluster_id = %cluster_id,
            steps = spec.steps.len(),
            "Cluster created"
        );
        Ok(handle)
    }

    /// Current snapshot of a cluster, or `None` if this manager never
    /// created it or already evicted it.
    pub async fn describe(&self, cluster_id: &str) -> Option<ClusterHandle> {
        let shared = {
            let clusters = self.clusters.read().await;
            Arc::clone(&clusters.get(cluster_id)?.handle)
        };
        let snapshot = shared.read().await.clone();
        Some(snapshot)
    }

    pub async fn handle_for_job(&self, job_id: &str) -> Option<ClusterHandle> {
        let cluster_id = self.jobs.read().await.get(job_id).cloned()?;
        self.describe(&cluster_id).await
    }

    /// Force a running cluster to `FAILED` with `reason`. No-op for a
    /// cluster that is already terminal.
    pub async fn terminate(
        &self,
        cluster_id: &str,
        reason: TerminationReason,
    ) -> Result<(), ClusterManagerError> {
        let clusters = self.clusters.read().await;
        let managed = clusters
            .get(cluster_id)
            .ok_or_else(|| ClusterManagerError::ClusterNotFound(cluster_id.to_string()))?;

        if managed.handle.read().await.is_terminal() {
            return Ok(());
        }
        let _ = managed.requested.set(reason);
        managed.cancel.cancel();
        tracing::info!(cluster_id, reason = %reason, "Cluster termination requested");
        Ok(())
    }

    /// Cancel every in-flight cluster and wait briefly for their tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down cluster manager");
        self.cancel.cancel();

        let tasks: Vec<(ClusterId, JoinHandle<()>)> = {
            let mut clusters = self.clusters.write().await;
            clusters
                .iter_mut()
                .filter_map(|(id, managed)| managed.task.take().map(|t| (id.clone(), t)))
                .collect()
        };
        for (cluster_id, task) in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!(cluster_id = %cluster_id, "Cluster task did not stop in time");
            }
        }
        tracing::info!("Cluster manager shut down complete");
    }

    /// Wait for a cluster's task to finish. Intended for tests and shutdown
    /// paths that need the terminal state.
    pub async fn wait_for_terminal(&self, cluster_id: &str) -> Option<ClusterHandle> {
        let (shared, task) = {
            let mut clusters = self.clusters.write().await;
            let managed = clusters.get_mut(cluster_id)?;
            (Arc::clone(&managed.handle), managed.task.take())
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(cluster_id, error = %e, "Cluster task panicked");
            }
        }
        let snapshot = shared.read().await.clone();
        Some(snapshot)
    }

    /// Evict clusters that finished more than `terminal_retention` ago.
    /// Returns how many were removed.
    pub async fn prune_terminal(&self) -> usize {
        let retention = self.config.terminal_retention;
        let now = Instant::now();

        let evicted: Vec<(ClusterId, JobId)> = {
            let mut clusters = self.clusters.write().await;
            let expired: Vec<ClusterId> = clusters
                .iter()
                .filter(|(_, managed)| {
                    managed
                        .finished
                        .get()
                        .is_some_and(|at| now.saturating_duration_since(*at) >= retention)
                })
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|id| clusters.remove(&id).map(|managed| (id, managed.job_id)))
                .collect()
        };
        if evicted.is_empty() {
            return 0;
        }

        let mut jobs = self.jobs.write().await;
        for (cluster_id, job_id) in &evicted {
            // A newer cluster for the same job keeps its index entry.
            if jobs.get(job_id) == Some(cluster_id) {
                jobs.remove(job_id);
            }
        }
        tracing::debug!(
            evicted = evicted.len(),
            remaining = jobs.len(),
            "Pruned terminal clusters"
        );
        evicted.len()
    }

    /// Number of clusters currently tracked, running or retained.
    pub async fn tracked(&self) -> usize {
        self.clusters.read().await.len()
    }
}

// ---------------------------------------------------------------------------
// Per-cluster task
// ---------------------------------------------------------------------------

struct ClusterRun {
    backend: Arc<dyn ClusterBackend>,
    publisher: Arc<dyn CompletionPublisher>,
    handle: Arc<RwLock<ClusterHandle>>,
    spec: JobSpec,
    cancel: CancellationToken,
    requested: Arc<OnceLock<TerminationReason>>,
    finished: Arc<OnceLock<Instant>>,
    max_run_duration: Duration,
    publish_retry: RetryPolicy,
}

impl ClusterRun {
    async fn drive(self) {
        let cluster_id = self.handle.read().await.cluster_id.clone();

        let (state, reason) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => (
                ClusterState::Failed,
                self.requested.get().copied().unwrap_or(TerminationReason::Cancelled),
            ),
            outcome = tokio::time::timeout(self.max_run_duration, self.run_steps(&cluster_id)) => {
                outcome.unwrap_or((ClusterState::Failed, TerminationReason::Timeout))
            }
        };

        if let Err(e) = self.backend.release(&cluster_id).await {
            tracing::warn!(cluster_id = %cluster_id, error = %e, "Failed to release cluster");
        }

        let event = {
            let mut handle = self.handle.write().await;
            handle.finish(state, reason);
            handle.completion_event()
        };
        if let Some(event) = event {
            self.report(state, reason, &cluster_id, &event).await;
        }
        let _ = self.finished.set(Instant::now());
    }

    async fn report(
        &self,
        state: ClusterState,
        reason: TerminationReason,
        cluster_id: &str,
        event: &CompletionEvent,
    ) {
        match state {
            ClusterState::Terminated => tracing::info!(
                cluster_id,
                job_id = %self.spec.job_id,
                warnings = event.step_failures.len(),
                "Cluster terminated"
            ),
            _ => tracing::warn!(
                cluster_id,
                job_id = %self.spec.job_id,
                reason = %reason,
                "Cluster failed"
            ),
        }

        publish_with_retry(self.publisher.as_ref(), event, &self.publish_retry).await;
    }

    /// Provision, then run every step in submitted order.
    async fn run_steps(&self, cluster_id: &str) -> (ClusterState, TerminationReason) {
        if let Err(e) = self.backend.wait_until_ready(cluster_id, &self.spec).await {
            tracing::warn!(cluster_id, error = %e, "Cluster provisioning failed");
            return (ClusterState::Failed, TerminationReason::ProvisioningFailed);
        }
        self.handle.write().await.state = ClusterState::Running;
        tracing::info!(cluster_id, "Cluster running");

        for step in &self.spec.steps {
            self.handle
                .write()
                .await
                .executed_steps
                .push(step.name.clone());

            let Err(e) = self.backend.run_step(cluster_id, &self.spec, step).await else {
                tracing::debug!(cluster_id, step = %step.name, "Step completed");
                continue;
            };

            let failure = StepFailure {
                step: step.name.clone(),
                message: e.to_string(),
            };
            self.handle.write().await.step_failures.push(failure);
            match step.on_failure {
                FailurePolicy::Continue => {
                    tracing::warn!(cluster_id, step = %step.name, error = %e, "Step failed, continuing");
                }
                FailurePolicy::Terminate => {
                    tracing::warn!(cluster_id, step = %step.name, error = %e, "Step failed, terminating cluster");
                    return (ClusterState::Failed, TerminationReason::StepFailed);
                }
            }
        }
        (ClusterState::Terminated, TerminationReason::Completed)
    }
}

async fn publish_with_retry(
    publisher: &dyn CompletionPublisher,
    event: &CompletionEvent,
    policy: &RetryPolicy,
) -> bool {
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match publisher.publish(event).await {
            Ok(()) => return true,
            Err(e) if attempt == max_attempts => {
                tracing::error!(
                    cluster_id = %event.cluster_id,
                    attempts = attempt,
                    error = %e,
                    "Giving up publishing completion event"
                );
            }
            Err(e) => {
                let delay = policy.jittered_backoff_for(attempt);
                tracing::warn!(
                    cluster_id = %event.cluster_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to publish completion event, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    false
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterManagerError {
    #[error("Cluster {0} not found")]
    ClusterNotFound(ClusterId),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
