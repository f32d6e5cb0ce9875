//! The external compute-cluster service.

use async_trait::async_trait;
use clusterflow_core::job_spec::{JobSpec, StepSpec};
use clusterflow_core::ClusterId;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The service could not be reached or is throttling. Worth retrying.
    #[error("Cluster service unavailable: {0}")]
    Unavailable(String),

    /// The service refused the request as invalid.
    #[error("Cluster request rejected: {0}")]
    Rejected(String),

    #[error("Cluster provisioning failed: {0}")]
    Provisioning(String),

    #[error("{0}")]
    Step(String),

    #[error("Unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to get a job accepted by the cluster service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    /// Retried through queue redelivery.
    #[error("Transient submission error: {0}")]
    Transient(String),

    /// Malformed job spec; retrying cannot help.
    #[error("Permanent submission error: {0}")]
    Permanent(String),
}

impl From<BackendError> for SubmissionError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Rejected(msg) => Self::Permanent(msg),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Cluster service operations used by the manager.
///
/// `create` only has to get the request accepted; provisioning happens in
/// `wait_until_ready`, which the manager calls from the cluster's own task.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Request a cluster for `spec`. Returns the service-assigned id.
    async fn create(&self, spec: &JobSpec) -> Result<ClusterId, BackendError>;

    /// Block until the cluster can run steps.
    async fn wait_until_ready(&self, cluster_id: &str, spec: &JobSpec)
        -> Result<(), BackendError>;

    /// Run one step to completion. `Err` means the step failed.
    async fn run_step(
        &self,
        cluster_id: &str,
        spec: &JobSpec,
        step: &StepSpec,
    ) -> Result<(), BackendError>;

    /// Tear the cluster down. Must tolerate repeated calls.
    async fn release(&self, cluster_id: &str) -> Result<(), BackendError>;
}
