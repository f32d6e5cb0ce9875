//! Local cluster backend that runs step commands as child processes.
//!
//! Each cluster is a working directory under the configured root holding the
//! serialised job spec. Steps run with that directory as their working
//! directory and the job context in `CLUSTERFLOW_*` environment variables.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use clusterflow_core::job_spec::{JobSpec, StepSpec};
use clusterflow_core::ClusterId;
use tokio::process::Command;
use uuid::Uuid;

use crate::backend::{BackendError, ClusterBackend};

/// Stderr kept in a step failure message.
const MAX_STDERR_CHARS: usize = 512;

const SPEC_FILE: &str = "job-spec.json";

pub struct ProcessBackend {
    root: PathBuf,
}

impl ProcessBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn cluster_dir(&self, cluster_id: &str) -> PathBuf {
        self.root.join(cluster_id)
    }
}

#[async_trait]
impl ClusterBackend for ProcessBackend {
    async fn create(&self, spec: &JobSpec) -> Result<ClusterId, BackendError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            BackendError::Unavailable(format!(
                "cluster work root {} is not usable: {e}",
                self.root.display()
            ))
        })?;
        let cluster_id = format!("j-{}", Uuid::now_v7().simple());
        tracing::debug!(cluster_id = %cluster_id, job_id = %spec.job_id, "Local cluster allocated");
        Ok(cluster_id)
    }

    async fn wait_until_ready(
        &self,
        cluster_id: &str,
        spec: &JobSpec,
    ) -> Result<(), BackendError> {
        let dir = self.cluster_dir(cluster_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::Provisioning(format!("{}: {e}", dir.display())))?;
        let spec_json = serde_json::to_vec_pretty(spec)
            .map_err(|e| BackendError::Provisioning(e.to_string()))?;
        tokio::fs::write(dir.join(SPEC_FILE), spec_json)
            .await
            .map_err(|e| BackendError::Provisioning(e.to_string()))?;
        Ok(())
    }

    async fn run_step(
        &self,
        cluster_id: &str,
        spec: &JobSpec,
        step: &StepSpec,
    ) -> Result<(), BackendError> {
        let dir = self.cluster_dir(cluster_id);
        if !dir.is_dir() {
            return Err(BackendError::UnknownCluster(cluster_id.to_string()));
        }

        let mut cmd = Command::new(&step.command);
        cmd.args(&step.args)
            .current_dir(&dir)
            .env("CLUSTERFLOW_JOB_ID", &spec.job_id)
            .env("CLUSTERFLOW_CLUSTER_ID", cluster_id)
            .env("CLUSTERFLOW_SOURCE", spec.source.uri())
            .env("CLUSTERFLOW_DESTINATION", spec.destination.uri())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Killed if the cluster task is cancelled or times out mid-step.
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            BackendError::Step(format!("could not start '{}': {e}", step.command))
        })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = tail(stderr.trim(), MAX_STDERR_CHARS);
        let status = match output.status.code() {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        Err(BackendError::Step(if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        }))
    }

    async fn release(&self, cluster_id: &str) -> Result<(), BackendError> {
        remove_dir(&self.cluster_dir(cluster_id)).await
    }
}

async fn remove_dir(dir: &Path) -> Result<(), BackendError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
