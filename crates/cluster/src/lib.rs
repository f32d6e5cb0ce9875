//! Cluster Manager: owns the lifecycle of ephemeral compute clusters.
//!
//! [`ClusterManager`] submits [`JobSpec`](clusterflow_core::job_spec::JobSpec)s
//! to a [`ClusterBackend`], drives each cluster through
//! `PROVISIONING -> RUNNING -> {TERMINATED | FAILED}` in its own task, and
//! publishes exactly one completion event per cluster through a
//! [`CompletionPublisher`].

pub mod backend;
pub mod handle;
pub mod manager;
pub mod process;
pub mod publisher;

pub use backend::{BackendError, ClusterBackend, SubmissionError};
pub use handle::ClusterHandle;
pub use manager::{ClusterManager, ClusterManagerConfig, ClusterManagerError};
pub use process::ProcessBackend;
pub use publisher::{CompletionPublisher, PublishError, QueueCompletionPublisher};
