//! Completion handler.
//!
//! Finalizes job records from cluster completion events. Events arrive at
//! least once and in any order, so every step is either conditional on the
//! record's state or overwrite-safe: the output object is written under a key
//! derived from the job id, and the `SUBMITTED -> terminal` transition is a
//! CAS. Once the record is terminal, further events are discarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clusterflow_cloud::{MessageQueue, ObjectStore, QueueError, QueueMessage, StoreError};
use clusterflow_core::messages::{CompletionEvent, IngestionNotification};
use clusterflow_core::retry::RetryPolicy;
use clusterflow_core::{ClusterId, CoreError, FailureKind, JobRecord, JobState, TransitionFields};
use clusterflow_db::{CasOutcome, JobRegistry, RegistryError};
use clusterflow_events::{EventBus, OrchestratorEvent};

use crate::consumer::{Disposition, MessageHandler};
use crate::output::{JobResult, RESULT_CONTENT_TYPE};

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// No record references the cluster yet; the dispatcher's commit may
    /// still be in flight.
    #[error("No job record for cluster {0}")]
    UnknownCluster(ClusterId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode job output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to re-enqueue notification: {0}")]
    Enqueue(#[from] QueueError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// What a completion event did to its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Succeeded { warnings: usize },
    Failed { resubmitted: bool },
    /// The record was already terminal in the reported state.
    Duplicate,
    /// The event contradicts the record (different terminal state, stale
    /// generation); logged and discarded.
    Conflicting,
}

#[derive(Debug, Clone)]
pub struct CompletionHandlerConfig {
    /// Generations allowed per fingerprint; a failure below this bound
    /// re-enqueues the original notification.
    pub max_resubmissions: u32,
    /// Redelivery delay for events whose cluster id is not yet known.
    pub unknown_cluster_retry: Duration,
    /// Receives after which an unknown-cluster event is dead-lettered.
    pub max_unknown_receives: u32,
    /// Backoff for registry and store failures.
    pub retry: RetryPolicy,
}

impl Default for CompletionHandlerConfig {
    fn default() -> Self {
        Self {
            max_resubmissions: 1,
            unknown_cluster_retry: Duration::from_secs(30),
            max_unknown_receives: 10,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct CompletionHandler {
    registry: Arc<dyn JobRegistry>,
    store: Arc<dyn ObjectStore>,
    ingest_queue: Arc<dyn MessageQueue>,
    bus: Arc<EventBus>,
    destination_bucket: String,
    output_prefix: String,
    config: CompletionHandlerConfig,
}

impl CompletionHandler {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        store: Arc<dyn ObjectStore>,
        ingest_queue: Arc<dyn MessageQueue>,
        bus: Arc<EventBus>,
        destination_bucket: impl Into<String>,
        output_prefix: impl Into<String>,
        config: CompletionHandlerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            ingest_queue,
            bus,
            destination_bucket: destination_bucket.into(),
            output_prefix: output_prefix.into(),
            config,
        }
    }

    /// Apply a completion event to the record that owns its cluster.
    pub async fn finalize(
        &self,
        event: &CompletionEvent,
    ) -> Result<CompletionOutcome, CompletionError> {
        let record = self
            .registry
            .get_by_cluster_id(&event.cluster_id)
            .await?
            .ok_or_else(|| CompletionError::UnknownCluster(event.cluster_id.clone()))?;

        if record.cluster_id.as_deref() != Some(event.cluster_id.as_str())
            && record.is_superseded_cluster(&event.cluster_id)
        {
            return Ok(self.superseded(&record, event));
        }

        if let Some(job_id) = &event.job_id {
            if *job_id != record.job_id {
                tracing::warn!(
                    cluster_id = %event.cluster_id,
                    event_job_id = %job_id,
                    job_id = %record.job_id,
                    "Completion event names a different job, discarding"
                );
                return Ok(CompletionOutcome::Conflicting);
            }
        }

        match record.state {
            JobState::Submitted if event.is_success() => self.succeed(&record, event).await,
            JobState::Submitted => self.fail_job(&record, &event.failure_message()).await,
            state => Ok(self.already_settled(&record, state, event)),
        }
    }

    /// The event is for a cluster of an earlier generation. That generation
    /// already ended `FAILED`, so a failure report is a late duplicate and a
    /// success report contradicts the record.
    fn superseded(&self, record: &JobRecord, event: &CompletionEvent) -> CompletionOutcome {
        if event.is_success() {
            tracing::warn!(
                cluster_id = %event.cluster_id,
                job_id = %record.job_id,
                generation = record.generation,
                "Earlier generation reports success after it was failed, discarding"
            );
            CompletionOutcome::Conflicting
        } else {
            tracing::debug!(
                cluster_id = %event.cluster_id,
                job_id = %record.job_id,
                generation = record.generation,
                "Completion event for an earlier generation"
            );
            CompletionOutcome::Duplicate
        }
    }

    /// Write the result document, then `SUBMITTED -> SUCCEEDED`.
    async fn succeed(
        &self,
        record: &JobRecord,
        event: &CompletionEvent,
    ) -> Result<CompletionOutcome, CompletionError> {
        let warnings: Vec<String> = event.step_failures.iter().map(ToString::to_string).collect();

        let result = JobResult::new(
            record,
            &self.destination_bucket,
            &self.output_prefix,
            &event.cluster_id,
            warnings.clone(),
            event.timestamp,
        );
        let location =
            JobResult::location(&self.destination_bucket, &self.output_prefix, &record.job_id);
        self.store
            .put(&location, result.to_bytes()?, RESULT_CONTENT_TYPE)
            .await?;

        let outcome = self
            .registry
            .transition(
                &record.fingerprint,
                JobState::Submitted,
                JobState::Succeeded,
                TransitionFields::none().with_warnings(warnings.clone()),
            )
            .await?;

        if outcome == CasOutcome::Conflict {
            return self.after_lost_race(record, event).await;
        }

        if warnings.is_empty() {
            tracing::info!(
                job_id = %record.job_id,
                cluster_id = %event.cluster_id,
                output = %location,
                "Job succeeded"
            );
        } else {
            tracing::warn!(
                job_id = %record.job_id,
                cluster_id = %event.cluster_id,
                output = %location,
                warnings = ?warnings,
                "Job succeeded with non-fatal step failures"
            );
        }
        let count = warnings.len();
        self.bus.publish(OrchestratorEvent::job_succeeded(
            &record.job_id,
            &event.cluster_id,
            warnings,
        ));
        Ok(CompletionOutcome::Succeeded { warnings: count })
    }

    /// `SUBMITTED -> FAILED` with `error`, then either re-enqueue the
    /// original notification or leave the failure to the operator channel.
    pub async fn fail_job(
        &self,
        record: &JobRecord,
        error: &str,
    ) -> Result<CompletionOutcome, CompletionError> {
        let outcome = self
            .registry
            .transition(
                &record.fingerprint,
                JobState::Submitted,
                JobState::Failed,
                TransitionFields::none()
                    .with_error(error)
                    .with_failure(FailureKind::Cluster),
            )
            .await?;

        if outcome == CasOutcome::Conflict {
            let current = self.registry.get(&record.fingerprint).await?;
            return Ok(match current {
                Some(current) if current.state == JobState::Failed => CompletionOutcome::Duplicate,
                _ => CompletionOutcome::Conflicting,
            });
        }

        let mut resubmitted = false;
        if record.generation < self.config.max_resubmissions {
            match self.resubmit(record).await {
                Ok(()) => resubmitted = true,
                Err(e) => tracing::error!(
                    job_id = %record.job_id,
                    error = %e,
                    "Failed to re-enqueue failed job"
                ),
            }
        }

        tracing::error!(
            job_id = %record.job_id,
            cluster_id = ?record.cluster_id,
            generation = record.generation,
            resubmitted,
            error,
            "Job failed"
        );
        self.bus.publish(OrchestratorEvent::job_failed(
            &record.job_id,
            record.fingerprint.as_str(),
            record.cluster_id.as_deref(),
            error,
            resubmitted,
        ));
        Ok(CompletionOutcome::Failed { resubmitted })
    }

    /// Put the record's notification back on the ingest queue. The stored
    /// content version is carried explicitly so the fingerprint is unchanged.
    async fn resubmit(&self, record: &JobRecord) -> Result<(), CompletionError> {
        let notification = IngestionNotification {
            source: record.source.clone(),
            event_time: record.created_at,
            version: Some(record.content_version.clone()),
        };
        let body = notification.to_body()?;
        self.ingest_queue.send(&body).await?;
        Ok(())
    }

    async fn after_lost_race(
        &self,
        record: &JobRecord,
        event: &CompletionEvent,
    ) -> Result<CompletionOutcome, CompletionError> {
        match self.registry.get(&record.fingerprint).await? {
            Some(current) => Ok(self.already_settled(&current, current.state, event)),
            None => Ok(CompletionOutcome::Conflicting),
        }
    }

    fn already_settled(
        &self,
        record: &JobRecord,
        state: JobState,
        event: &CompletionEvent,
    ) -> CompletionOutcome {
        let matches = match state {
            JobState::Succeeded => event.is_success(),
            JobState::Failed => !event.is_success(),
            JobState::Pending | JobState::Submitted => false,
        };
        if matches {
            tracing::debug!(
                job_id = %record.job_id,
                cluster_id = %event.cluster_id,
                state = %state,
                "Duplicate completion event"
            );
            CompletionOutcome::Duplicate
        } else {
            tracing::warn!(
                job_id = %record.job_id,
                cluster_id = %event.cluster_id,
                state = %state,
                reported = %event.terminal_state,
                "Completion event conflicts with job record, discarding"
            );
            CompletionOutcome::Conflicting
        }
    }
}

#[async_trait]
impl MessageHandler for CompletionHandler {
    async fn handle(&self, message: &QueueMessage) -> Disposition {
        let event = match CompletionEvent::parse(&message.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(message_id = %message.message_id, error = %e, "Malformed completion event");
                return Disposition::DeadLetter {
                    reason: e.to_string(),
                };
            }
        };

        match self.finalize(&event).await {
            Ok(_) => Disposition::Commit,
            Err(CompletionError::UnknownCluster(cluster_id)) => {
                if message.receive_count >= self.config.max_unknown_receives {
                    return Disposition::DeadLetter {
                        reason: format!(
                            "no job record for cluster {cluster_id} after {} deliveries",
                            message.receive_count
                        ),
                    };
                }
                tracing::debug!(
                    cluster_id = %cluster_id,
                    receive_count = message.receive_count,
                    "Completion event for unknown cluster, waiting for redelivery"
                );
                Disposition::Retry {
                    delay: self.config.unknown_cluster_retry,
                }
            }
            Err(e) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    cluster_id = %event.cluster_id,
                    error = %e,
                    "Failed to finalize job, leaving event for redelivery"
                );
                Disposition::Retry {
                    delay: self.config.retry.backoff_for(message.receive_count),
                }
            }
        }
    }
}
