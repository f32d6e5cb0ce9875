//! Operator-visible failure reporting.
//!
//! [`FailureReporter`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! and forwards every `JobFailed` event to the dead-letter queue as a
//! [`FailureNotice`]. Dead-lettered messages are already on that queue and
//! are only logged here.

use std::sync::Arc;

use clusterflow_cloud::{MessageQueue, QueueError};
use clusterflow_core::{ClusterId, JobId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::OrchestratorEvent;
use crate::dead_letter::DeadLetterKind;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to encode failure notice: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    /// Always [`DeadLetterKind::JobFailed`].
    pub kind: DeadLetterKind,
    pub job_id: JobId,
    pub fingerprint: String,
    pub cluster_id: Option<ClusterId>,
    pub error: String,
    pub will_retry: bool,
    pub failed_at: Timestamp,
}

pub struct FailureReporter {
    dead_letter: Arc<dyn MessageQueue>,
}

impl FailureReporter {
    pub fn new(dead_letter: Arc<dyn MessageQueue>) -> Self {
        Self { dead_letter }
    }

    /// Run until cancelled or until the bus is dropped.
    pub async fn run(
        &self,
        mut receiver: broadcast::Receiver<OrchestratorEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Failure reporter cancelled");
                    break;
                }
                received = receiver.recv() => received,
            };
            match received {
                Ok(event) => self.handle(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Failure reporter lagged, some events were not reported");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, failure reporter shutting down");
                    break;
                }
            }
        }
    }

    async fn handle(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::JobFailed {
                job_id,
                fingerprint,
                cluster_id,
                error,
                will_retry,
                timestamp,
            } => {
                tracing::error!(
                    job_id = %job_id,
                    fingerprint = %fingerprint,
                    cluster_id = ?cluster_id,
                    will_retry,
                    error = %error,
                    "Job failed"
                );
                let notice = FailureNotice {
                    kind: DeadLetterKind::JobFailed,
                    job_id,
                    fingerprint,
                    cluster_id,
                    error,
                    will_retry,
                    failed_at: timestamp,
                };
                if let Err(e) = self.send(&notice).await {
                    tracing::error!(job_id = %notice.job_id, error = %e, "Failed to report job failure");
                }
            }
            OrchestratorEvent::MessageDeadLettered {
                queue,
                message_id,
                reason,
                ..
            } => {
                tracing::error!(
                    queue = %queue,
                    message_id = %message_id,
                    reason = %reason,
                    "Message dead-lettered"
                );
            }
            OrchestratorEvent::JobSubmitted { .. } | OrchestratorEvent::JobSucceeded { .. } => {}
        }
    }

    async fn send(&self, notice: &FailureNotice) -> Result<(), ReportError> {
        let body = serde_json::to_string(notice)?;
        self.dead_letter.send(&body).await?;
        Ok(())
    }
}
