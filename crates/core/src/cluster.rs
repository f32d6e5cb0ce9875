//! Cluster lifecycle vocabulary shared by the Cluster Manager and the
//! Completion Handler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `PROVISIONING -> RUNNING -> {TERMINATED | FAILED}`; provisioning may fail
/// straight to `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Provisioning,
    Running,
    Terminated,
    Failed,
}

impl ClusterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cluster reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// All steps ran (some may have failed under `CONTINUE`).
    Completed,
    /// A `TERMINATE` step failed.
    StepFailed,
    ProvisioningFailed,
    Cancelled,
    Timeout,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::StepFailed => "STEP_FAILED",
            Self::ProvisioningFailed => "PROVISIONING_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step that failed; fatal or not depends on the step's failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' failed: {}", self.step, self.message)
    }
}
