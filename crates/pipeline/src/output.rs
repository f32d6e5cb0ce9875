//! The result document written for a successful job.

use clusterflow_core::cluster::ClusterState;
use clusterflow_core::storage_keys::{destination_uri, output_object_key};
use clusterflow_core::{ClusterId, JobId, JobRecord, ObjectRef, Timestamp};
use serde::{Deserialize, Serialize};

pub const RESULT_CONTENT_TYPE: &str = "application/json";

/// Written to `<prefix>/<jobId>/output`. Built only from the record and the
/// completion event, so rewriting it for a duplicate event yields the same
/// bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub fingerprint: String,
    pub source: ObjectRef,
    /// Directory the cluster steps wrote their output under.
    pub output_root: String,
    pub cluster_id: ClusterId,
    pub state: ClusterState,
    pub warnings: Vec<String>,
    pub completed_at: Timestamp,
}

impl JobResult {
    pub fn new(
        record: &JobRecord,
        bucket: &str,
        prefix: &str,
        cluster_id: &str,
        warnings: Vec<String>,
        completed_at: Timestamp,
    ) -> Self {
        Self {
            job_id: record.job_id.clone(),
            fingerprint: record.fingerprint.to_string(),
            source: record.source.clone(),
            output_root: destination_uri(bucket, prefix, &record.job_id),
            cluster_id: cluster_id.to_string(),
            state: ClusterState::Terminated,
            warnings,
            completed_at,
        }
    }

    pub fn location(bucket: &str, prefix: &str, job_id: &str) -> ObjectRef {
        ObjectRef::new(bucket, output_object_key(prefix, job_id))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}
