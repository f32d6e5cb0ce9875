//! Ingestion dispatcher.
//!
//! For every notification: fingerprint it, insert-if-absent into the
//! registry, build the job spec and submit it to the cluster manager. The
//! `PENDING -> SUBMITTED` transition followed by deleting the message is the
//! commit point. Duplicate deliveries are acknowledged without resubmitting;
//! correctness rests on the registry's CAS operations alone, so any number
//! of dispatchers may consume the same queue. Before creating a cluster a
//! dispatcher takes the record's submission claim, so dispatchers in
//! different processes never create two clusters for one job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clusterflow_cloud::{QueueError, QueueMessage};
use clusterflow_cluster::{ClusterManager, SubmissionError};
use clusterflow_core::cluster::TerminationReason;
use clusterflow_core::job_spec::{job_id_for, JobTemplate};
use clusterflow_core::messages::{parse_ingestion_body, IngestionNotification};
use clusterflow_core::retry::RetryPolicy;
use clusterflow_core::{FailureKind, Fingerprint, JobRecord, JobState, NewJobRecord, TransitionFields};
use clusterflow_db::{CasOutcome, JobRegistry, RegistryError};
use clusterflow_events::{DeadLetterChannel, EventBus, OrchestratorEvent};

use crate::consumer::{Disposition, MessageHandler};

/// Re-read rounds after losing a CAS before giving the message back.
const MAX_CAS_ROUNDS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Job record {0} disappeared while dispatching")]
    RecordVanished(String),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// `max_attempts` is the submission attempt budget per generation.
    pub retry: RetryPolicy,
    /// How many times a FAILED record may be reopened.
    pub max_resubmissions: u32,
    /// Worker instance recorded as the owner of claims and clusters.
    pub instance_id: String,
    /// Submission lease. Must outlast the cluster manager's submission
    /// timeout.
    pub claim_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_resubmissions: 1,
            instance_id: "local".into(),
            claim_ttl: Duration::from_secs(60),
        }
    }
}

/// Per-notification result; folded into one [`Disposition`] per message.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    /// Accepted now or earlier.
    Done,
    /// Permanently failed; the notification goes to the dead-letter queue.
    Rejected { reason: String },
    /// Leave the message for redelivery after `delay`.
    Retry { delay: Duration },
}

pub struct Dispatcher {
    registry: Arc<dyn JobRegistry>,
    clusters: Arc<ClusterManager>,
    template: Arc<JobTemplate>,
    dead_letter: DeadLetterChannel,
    bus: Arc<EventBus>,
    source_queue: String,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        clusters: Arc<ClusterManager>,
        template: Arc<JobTemplate>,
        dead_letter: DeadLetterChannel,
        bus: Arc<EventBus>,
        source_queue: impl Into<String>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            clusters,
            template,
            dead_letter,
            bus,
            source_queue: source_queue.into(),
            config,
        }
    }

    async fn dispatch(
        &self,
        notification: &IngestionNotification,
    ) -> Result<Outcome, DispatchError> {
        let fingerprint = notification.fingerprint();
        let created = self
            .registry
            .try_create(NewJobRecord {
                job_id: job_id_for(&fingerprint, 0),
                fingerprint: fingerprint.clone(),
                source: notification.source.clone(),
                content_version: notification.content_version(),
            })
            .await?;

        if created.created {
            tracing::info!(
                job_id = %created.record.job_id,
                fingerprint = %fingerprint,
                source = %notification.source,
                "Job record created"
            );
        }

        let mut record = created.record;
        for _ in 0..MAX_CAS_ROUNDS {
            match record.state {
                JobState::Pending => {
                    if self.claim(&record).await? {
                        return self.submit(&record).await;
                    }
                    record = self.reload(&fingerprint).await?;
                    if record.state == JobState::Pending {
                        return Ok(self.claimed_elsewhere(&record));
                    }
                }
                JobState::Submitted | JobState::Succeeded => {
                    tracing::debug!(
                        job_id = %record.job_id,
                        state = %record.state,
                        "Duplicate delivery, job already accepted"
                    );
                    return Ok(Outcome::Done);
                }
                JobState::Failed => {
                    if record.failure_kind == Some(FailureKind::Permanent) {
                        tracing::info!(
                            job_id = %record.job_id,
                            error = ?record.last_error,
                            "Job was rejected permanently, ignoring delivery"
                        );
                        return Ok(Outcome::Done);
                    }
                    if record.generation >= self.config.max_resubmissions {
                        tracing::info!(
                            job_id = %record.job_id,
                            generation = record.generation,
                            "Failed job has no resubmission budget left, ignoring delivery"
                        );
                        return Ok(Outcome::Done);
                    }
                    let next_job_id = job_id_for(&fingerprint, record.generation + 1);
                    let reopened = self
                        .registry
                        .reopen(&fingerprint, record.generation, &next_job_id)
                        .await?;
                    if reopened.is_applied() {
                        tracing::info!(
                            job_id = %next_job_id,
                            previous_job_id = %record.job_id,
                            generation = record.generation + 1,
                            "Failed job reopened for resubmission"
                        );
                    }
                    // Either way, continue from whatever is stored now.
                    record = self.reload(&fingerprint).await?;
                }
            }
        }
        Ok(self.retry_outcome(1))
    }

    async fn reload(&self, fingerprint: &Fingerprint) -> Result<JobRecord, DispatchError> {
        self.registry
            .get(fingerprint)
            .await?
            .ok_or_else(|| DispatchError::RecordVanished(fingerprint.to_string()))
    }

    /// Take the submission lease for this instance.
    async fn claim(&self, record: &JobRecord) -> Result<bool, DispatchError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.claim_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let claimed = self
            .registry
            .claim_submission(
                &record.fingerprint,
                &record.job_id,
                &self.config.instance_id,
                now,
                now + ttl,
            )
            .await?;
        Ok(claimed.is_applied())
    }

    /// Another dispatcher is submitting this job; come back once its lease
    /// could have lapsed.
    fn claimed_elsewhere(&self, record: &JobRecord) -> Outcome {
        let remaining = record
            .claim_expires_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or_default();
        let delay = remaining.max(self.config.retry.backoff_for(1));
        tracing::debug!(
            job_id = %record.job_id,
            owner = ?record.owner_id,
            delay_ms = delay.as_millis() as u64,
            "Submission claimed by another dispatcher, retrying later"
        );
        Outcome::Retry { delay }
    }

    /// Build and submit the spec for a `PENDING` record this instance has
    /// claimed.
    async fn submit(&self, record: &JobRecord) -> Result<Outcome, DispatchError> {
        let spec = match self.template.build(record) {
            Ok(spec) => spec,
            Err(e) => {
                let reason = format!("malformed job spec: {e}");
                return self.reject(record, reason, FailureKind::Permanent).await;
            }
        };

        let handle = match self.clusters.submit(&spec).await {
            Ok(handle) => handle,
            Err(SubmissionError::Permanent(msg)) => {
                return self.reject(record, msg, FailureKind::Permanent).await
            }
            Err(SubmissionError::Transient(msg)) => {
                return self.record_transient_failure(record, msg).await
            }
        };

        let outcome = self
            .registry
            .transition(
                &record.fingerprint,
                JobState::Pending,
                JobState::Submitted,
                TransitionFields::none()
                    .with_cluster_id(handle.cluster_id.clone())
                    .with_owner(self.config.instance_id.clone()),
            )
            .await?;

        match outcome {
            CasOutcome::Applied => {
                tracing::info!(
                    job_id = %record.job_id,
                    cluster_id = %handle.cluster_id,
                    fingerprint = %record.fingerprint,
                    "Job submitted"
                );
                self.bus.publish(OrchestratorEvent::job_submitted(
                    &record.job_id,
                    record.fingerprint.as_str(),
                    &handle.cluster_id,
                ));
            }
            CasOutcome::Conflict => {
                let current = self.registry.get(&record.fingerprint).await?;
                let owns_cluster = current
                    .as_ref()
                    .and_then(|r| r.cluster_id.as_deref())
                    == Some(handle.cluster_id.as_str());
                if !owns_cluster {
                    tracing::warn!(
                        job_id = %record.job_id,
                        cluster_id = %handle.cluster_id,
                        state = ?current.as_ref().map(|r| r.state),
                        "Lost submission race, terminating orphaned cluster"
                    );
                    if let Err(e) = self
                        .clusters
                        .terminate(&handle.cluster_id, TerminationReason::Cancelled)
                        .await
                    {
                        tracing::warn!(cluster_id = %handle.cluster_id, error = %e, "Failed to terminate orphaned cluster");
                    }
                }
            }
        }
        Ok(Outcome::Done)
    }

    async fn record_transient_failure(
        &self,
        record: &JobRecord,
        error: String,
    ) -> Result<Outcome, DispatchError> {
        let Some(attempts) = self
            .registry
            .record_attempt(&record.fingerprint, &error)
            .await?
        else {
            // Someone else moved the record on; the next delivery sorts it out.
            return Ok(self.retry_outcome(1));
        };

        if !self.config.retry.is_exhausted(attempts) {
            let delay = self.config.retry.jittered_backoff_for(attempts);
            tracing::warn!(
                job_id = %record.job_id,
                attempts,
                max_attempts = self.config.retry.max_attempts,
                delay_secs = delay.as_secs(),
                error = %error,
                "Transient submission failure, will retry"
            );
            return Ok(Outcome::Retry { delay });
        }

        self.reject(
            record,
            format!("submission failed after {attempts} attempts: {error}"),
            FailureKind::SubmissionExhausted,
        )
        .await
    }

    /// `PENDING -> FAILED` and reject the notification.
    async fn reject(
        &self,
        record: &JobRecord,
        reason: String,
        kind: FailureKind,
    ) -> Result<Outcome, DispatchError> {
        let outcome = self
            .registry
            .transition(
                &record.fingerprint,
                JobState::Pending,
                JobState::Failed,
                TransitionFields::none()
                    .with_error(reason.clone())
                    .with_failure(kind),
            )
            .await?;
        if outcome.is_applied() {
            tracing::error!(
                job_id = %record.job_id,
                error = %reason,
                failure_kind = %kind,
                "Job failed before submission"
            );
            self.bus.publish(OrchestratorEvent::job_failed(
                &record.job_id,
                record.fingerprint.as_str(),
                None,
                reason.clone(),
                false,
            ));
        }
        Ok(Outcome::Rejected { reason })
    }

    fn retry_outcome(&self, attempt: u32) -> Outcome {
        Outcome::Retry {
            delay: self.config.retry.backoff_for(attempt),
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: &QueueMessage) -> Disposition {
        let notifications = match parse_ingestion_body(&message.body) {
            Ok(notifications) => notifications,
            Err(e) => {
                tracing::error!(message_id = %message.message_id, error = %e, "Malformed ingestion message");
                return Disposition::DeadLetter {
                    reason: e.to_string(),
                };
            }
        };

        let single = notifications.len() == 1;
        let mut retry_after: Option<Duration> = None;

        for notification in &notifications {
            let outcome = match self.dispatch(notification).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        source = %notification.source,
                        error = %e,
                        "Dispatch failed, leaving message for redelivery"
                    );
                    self.retry_outcome(message.receive_count)
                }
            };

            match outcome {
                Outcome::Done => {}
                Outcome::Retry { delay } => {
                    retry_after = Some(retry_after.map_or(delay, |d| d.max(delay)));
                }
                Outcome::Rejected { reason } => {
                    let body = if single {
                        Ok(message.body.clone())
                    } else {
                        notification.to_body().map_err(|e| e.to_string())
                    };
                    let sent = match body {
                        Ok(body) => self
                            .dead_letter
                            .send_body(&self.source_queue, message, &reason, &body)
                            .await
                            .map_err(|e| e.to_string()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        tracing::error!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to dead-letter notification, leaving message for redelivery"
                        );
                        let delay = self.config.retry.backoff_for(message.receive_count);
                        retry_after = Some(retry_after.map_or(delay, |d| d.max(delay)));
                    }
                }
            }
        }

        match retry_after {
            Some(delay) => Disposition::Retry { delay },
            None => Disposition::Commit,
        }
    }
}
