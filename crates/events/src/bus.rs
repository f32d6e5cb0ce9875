//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the dispatcher, the
//! completion handler and the failure reporter.

use chrono::Utc;
use clusterflow_core::{ClusterId, JobId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// OrchestratorEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    JobSubmitted {
        job_id: JobId,
        fingerprint: String,
        cluster_id: ClusterId,
        timestamp: Timestamp,
    },
    JobSucceeded {
        job_id: JobId,
        cluster_id: ClusterId,
        warnings: Vec<String>,
        timestamp: Timestamp,
    },
    JobFailed {
        job_id: JobId,
        fingerprint: String,
        cluster_id: Option<ClusterId>,
        error: String,
        /// Whether the notification was re-enqueued for another generation.
        will_retry: bool,
        timestamp: Timestamp,
    },
    MessageDeadLettered {
        queue: String,
        message_id: String,
        reason: String,
        timestamp: Timestamp,
    },
}

impl OrchestratorEvent {
    pub fn job_submitted(job_id: &str, fingerprint: &str, cluster_id: &str) -> Self {
        Self::JobSubmitted {
            job_id: job_id.to_string(),
            fingerprint: fingerprint.to_string(),
            cluster_id: cluster_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn job_succeeded(job_id: &str, cluster_id: &str, warnings: Vec<String>) -> Self {
        Self::JobSucceeded {
            job_id: job_id.to_string(),
            cluster_id: cluster_id.to_string(),
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn job_failed(
        job_id: &str,
        fingerprint: &str,
        cluster_id: Option<&str>,
        error: impl Into<String>,
        will_retry: bool,
    ) -> Self {
        Self::JobFailed {
            job_id: job_id.to_string(),
            fingerprint: fingerprint.to_string(),
            cluster_id: cluster_id.map(str::to_string),
            error: error.into(),
            will_retry,
            timestamp: Utc::now(),
        }
    }

    /// Dotted name for logs, e.g. `job.failed`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobSubmitted { .. } => "job.submitted",
            Self::JobSucceeded { .. } => "job.succeeded",
            Self::JobFailed { .. } => "job.failed",
            Self::MessageDeadLettered { .. } => "message.dead_lettered",
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: OrchestratorEvent) {
        // A send error only means there are no receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
