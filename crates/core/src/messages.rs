//! Wire schemas for the two inbound streams.
//!
//! Payloads are parsed into explicit types on receipt; anything that does not
//! match maps to [`CoreError::Malformed`] and is dead-lettered by the caller.
//!
//! - Ingestion queue bodies carry one [`IngestionNotification`] or a
//!   `{"records": [...]}` batch of them.
//! - Completion bodies are [`ServiceEvent`] envelopes tagged by `detailType`.

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterState, StepFailure, TerminationReason};
use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::types::{ClusterId, JobId, ObjectRef, Timestamp};

/// `source` value of events emitted by the cluster service.
pub const COMPLETION_SOURCE: &str = "cluster-service";

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// "A new object appeared in the store."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionNotification {
    pub source: ObjectRef,
    pub event_time: Timestamp,
    /// Object version or etag, when the store reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl IngestionNotification {
    pub fn new(source: ObjectRef, event_time: Timestamp) -> Self {
        Self {
            source,
            event_time,
            version: None,
        }
    }

    /// Store version if present, otherwise the event time.
    pub fn content_version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| self.event_time.to_rfc3339())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(&self.source, &self.content_version())
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.source.container.trim().is_empty() {
            return Err(CoreError::Malformed("source.container is empty".into()));
        }
        if self.source.key.trim().is_empty() {
            return Err(CoreError::Malformed("source.objectKey is empty".into()));
        }
        Ok(())
    }

    /// Serialise as a single-notification queue body.
    pub fn to_body(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestionBody {
    Batch { records: Vec<IngestionNotification> },
    Single(IngestionNotification),
}

/// Parse an ingestion queue body into its notifications (at least one).
pub fn parse_ingestion_body(body: &str) -> Result<Vec<IngestionNotification>, CoreError> {
    let parsed: IngestionBody = serde_json::from_str(body).map_err(|e| {
        CoreError::Malformed(format!("ingestion body is not a notification: {e}"))
    })?;

    let records = match parsed {
        IngestionBody::Batch { records } => records,
        IngestionBody::Single(notification) => vec![notification],
    };
    if records.is_empty() {
        return Err(CoreError::Malformed("ingestion batch has no records".into()));
    }
    for record in &records {
        record.validate()?;
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// `detail` of a `ClusterStateChange` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStateDetail {
    pub cluster_id: ClusterId,
    pub state: ClusterState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminationReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_failures: Vec<StepFailure>,
}

/// Event-stream envelope, tagged by `detailType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "detailType")]
pub enum ServiceEvent {
    #[serde(rename_all = "camelCase")]
    ClusterStateChange {
        source: String,
        time: Timestamp,
        detail: ClusterStateDetail,
    },
}

/// A cluster reached a terminal state. Delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub cluster_id: ClusterId,
    pub job_id: Option<JobId>,
    pub terminal_state: ClusterState,
    pub reason: Option<TerminationReason>,
    pub step_failures: Vec<StepFailure>,
    pub timestamp: Timestamp,
}

impl CompletionEvent {
    /// Parse and validate a completion body.
    pub fn parse(body: &str) -> Result<Self, CoreError> {
        let event: ServiceEvent = serde_json::from_str(body)
            .map_err(|e| CoreError::Malformed(format!("completion body: {e}")))?;

        let ServiceEvent::ClusterStateChange {
            source,
            time,
            detail,
        } = event;

        if source != COMPLETION_SOURCE {
            return Err(CoreError::Malformed(format!(
                "unexpected event source '{source}'"
            )));
        }
        if !detail.state.is_terminal() {
            return Err(CoreError::Malformed(format!(
                "cluster {} reported non-terminal state {}",
                detail.cluster_id, detail.state
            )));
        }
        if detail.cluster_id.trim().is_empty() {
            return Err(CoreError::Malformed("detail.clusterId is empty".into()));
        }

        Ok(Self {
            cluster_id: detail.cluster_id,
            job_id: detail.job_id,
            terminal_state: detail.state,
            reason: detail.reason,
            step_failures: detail.step_failures,
            timestamp: time,
        })
    }

    pub fn to_envelope(&self) -> ServiceEvent {
        ServiceEvent::ClusterStateChange {
            source: COMPLETION_SOURCE.to_string(),
            time: self.timestamp,
            detail: ClusterStateDetail {
                cluster_id: self.cluster_id.clone(),
                state: self.terminal_state,
                job_id: self.job_id.clone(),
                reason: self.reason,
                step_failures: self.step_failures.clone(),
            },
        }
    }

    pub fn to_body(&self) -> Result<String, CoreError> {
        serde_json::to_string(&self.to_envelope()).map_err(|e| CoreError::Internal(e.to_string()))
    }

    pub fn is_success(&self) -> bool {
        self.terminal_state == ClusterState::Terminated
    }

    /// Human-readable failure description for `lastError`.
    pub fn failure_message(&self) -> String {
        let reason = self
            .reason
            .map(|r| r.as_str())
            .unwrap_or("UNKNOWN");
        match self.step_failures.last() {
            Some(failure) => format!("cluster {} failed ({reason}): {failure}", self.cluster_id),
            None => format!("cluster {} failed ({reason})", self.cluster_id),
        }
    }
}
