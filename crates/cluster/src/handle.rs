use chrono::Utc;
use clusterflow_core::cluster::{ClusterState, StepFailure, TerminationReason};
use clusterflow_core::messages::CompletionEvent;
use clusterflow_core::{ClusterId, JobId, Timestamp};
use serde::Serialize;

/// Snapshot of a cluster as tracked by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHandle {
    pub cluster_id: ClusterId,
    pub job_id: JobId,
    pub state: ClusterState,
    /// Set once the cluster is terminal.
    pub reason: Option<TerminationReason>,
    /// Step failures in execution order. On a `TERMINATED` cluster all of
    /// them were non-fatal.
    pub step_failures: Vec<StepFailure>,
    /// Names of the steps that were started, in order.
    pub executed_steps: Vec<String>,
    pub created_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

impl ClusterHandle {
    pub fn provisioning(cluster_id: ClusterId, job_id: JobId) -> Self {
        Self {
            cluster_id,
            job_id,
            state: ClusterState::Provisioning,
            reason: None,
            step_failures: Vec::new(),
            executed_steps: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Enter a terminal state. A terminal handle never changes again.
    pub(crate) fn finish(&mut self, state: ClusterState, reason: TerminationReason) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = state;
        self.reason = Some(reason);
        self.ended_at = Some(Utc::now());
        true
    }

    /// Completion event describing the terminal state, if reached.
    pub fn completion_event(&self) -> Option<CompletionEvent> {
        if !self.is_terminal() {
            return None;
        }
        Some(CompletionEvent {
            cluster_id: self.cluster_id.clone(),
            job_id: Some(self.job_id.clone()),
            terminal_state: self.state,
            reason: self.reason,
            step_failures: self.step_failures.clone(),
            timestamp: self.ended_at.unwrap_or(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_state_is_sticky() {
        let mut handle = ClusterHandle::provisioning("c-1".into(), "job-1".into());
        assert!(handle.completion_event().is_none());

        assert!(handle.finish(ClusterState::Failed, TerminationReason::Timeout));
        assert!(!handle.finish(ClusterState::Terminated, TerminationReason::Completed));

        let event = handle.completion_event().unwrap();
        assert_eq!(event.terminal_state, ClusterState::Failed);
        assert_eq!(event.reason, Some(TerminationReason::Timeout));
        assert_eq!(event.job_id.as_deref(), Some("job-1"));
    }
}
