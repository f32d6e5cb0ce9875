//! Deterministic job specifications.
//!
//! [`JobTemplate`] holds the configured topology and step templates and
//! turns a [`JobRecord`] into a [`JobSpec`]. The same record always yields
//! the same spec: step order is preserved and nothing is randomised.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::job::JobRecord;
use crate::storage_keys::{destination_uri, output_object_key};
use crate::types::{JobId, ObjectRef};

/// Namespace for job id derivation. Changing it changes every job id.
const JOB_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5d1c_8a3e_4b7f_4e0a_9c62_17f0_a4d3_e8b1);

/// Derive the job id for a fingerprint in a given generation.
pub fn job_id_for(fingerprint: &Fingerprint, generation: u32) -> JobId {
    let name = format!("{fingerprint}:{generation}");
    format!("job-{}", Uuid::new_v5(&JOB_ID_NAMESPACE, name.as_bytes()))
}

/// What happens to the remaining steps when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    Continue,
    Terminate,
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Terminate
}

/// One step of a cluster job. The command itself is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_failure_policy")]
    pub on_failure: FailurePolicy,
}

impl StepSpec {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        on_failure: FailurePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            on_failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRole {
    Master,
    Core,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    pub name: String,
    pub role: InstanceRole,
    pub market: String,
    pub instance_type: String,
    pub instance_count: u32,
}

/// Cluster shape requested from the compute service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTopology {
    pub release_label: String,
    pub log_uri: Option<String>,
    pub instance_groups: Vec<InstanceGroup>,
    /// Ephemeral clusters shut down once their steps are done.
    pub keep_alive_when_no_steps: bool,
}

impl InstanceTopology {
    /// One on-demand master node plus `core_count` on-demand core nodes.
    pub fn standard(
        master_instance_type: impl Into<String>,
        core_instance_type: impl Into<String>,
        core_count: u32,
        release_label: impl Into<String>,
        log_uri: Option<String>,
    ) -> Self {
        Self {
            release_label: release_label.into(),
            log_uri,
            instance_groups: vec![
                InstanceGroup {
                    name: "Master nodes".into(),
                    role: InstanceRole::Master,
                    market: "ON_DEMAND".into(),
                    instance_type: master_instance_type.into(),
                    instance_count: 1,
                },
                InstanceGroup {
                    name: "Core nodes".into(),
                    role: InstanceRole::Core,
                    market: "ON_DEMAND".into(),
                    instance_type: core_instance_type.into(),
                    instance_count: core_count,
                },
            ],
            keep_alive_when_no_steps: false,
        }
    }

    pub fn total_instances(&self) -> u32 {
        self.instance_groups.iter().map(|g| g.instance_count).sum()
    }
}

/// Everything the Cluster Manager needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub job_id: JobId,
    pub fingerprint: Fingerprint,
    pub source: ObjectRef,
    /// Output object written by the Completion Handler.
    pub destination: ObjectRef,
    pub steps: Vec<StepSpec>,
    pub topology: InstanceTopology,
}

impl JobSpec {
    /// Reject specs that no cluster could ever run.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.source.container.trim().is_empty() || self.source.key.trim().is_empty() {
            return Err(CoreError::Validation(
                "Job source must name a container and a key".into(),
            ));
        }
        if self.steps.is_empty() {
            return Err(CoreError::Validation("Job must have at least one step".into()));
        }
        if let Some(step) = self.steps.iter().find(|s| s.command.trim().is_empty()) {
            return Err(CoreError::Validation(format!(
                "Step '{}' has an empty command",
                step.name
            )));
        }
        if self.topology.total_instances() == 0 {
            return Err(CoreError::Validation(
                "Cluster topology requests no instances".into(),
            ));
        }
        Ok(())
    }
}

/// Configured recipe for building job specs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub destination_bucket: String,
    pub output_prefix: String,
    pub topology: InstanceTopology,
    /// Step templates; arguments may contain `{container}`, `{key}`,
    /// `{job_id}`, `{destination}` and `{output_key}` placeholders.
    pub steps: Vec<StepSpec>,
}

impl JobTemplate {
    /// Build the spec for the record's current generation.
    pub fn build(&self, record: &JobRecord) -> Result<JobSpec, CoreError> {
        let output_key = output_object_key(&self.output_prefix, &record.job_id);
        let destination_dir =
            destination_uri(&self.destination_bucket, &self.output_prefix, &record.job_id);

        let render = |text: &str| {
            text.replace("{container}", &record.source.container)
                .replace("{key}", &record.source.key)
                .replace("{job_id}", &record.job_id)
                .replace("{destination}", &destination_dir)
                .replace("{output_key}", &output_key)
        };

        let steps = self
            .steps
            .iter()
            .map(|template| StepSpec {
                name: template.name.clone(),
                command: render(&template.command),
                args: template.args.iter().map(|a| render(a)).collect(),
                on_failure: template.on_failure,
            })
            .collect();

        let spec = JobSpec {
            job_id: record.job_id.clone(),
            fingerprint: record.fingerprint.clone(),
            source: record.source.clone(),
            destination: ObjectRef::new(self.destination_bucket.clone(), output_key),
            steps,
            topology: self.topology.clone(),
        };
        spec.validate()?;
        Ok(spec)
    }
}
