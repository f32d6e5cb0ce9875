//! Row model for the `job_records` table.

use clusterflow_core::{
    CoreError, FailureKind, Fingerprint, JobRecord, JobState, ObjectRef, Timestamp,
};
use sqlx::FromRow;

/// A row from the `job_records` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRecordRow {
    pub fingerprint: String,
    pub job_id: String,
    pub cluster_id: Option<String>,
    pub state_id: i16,
    pub attempts: i32,
    pub generation: i32,
    pub source_container: String,
    pub source_key: String,
    pub content_version: String,
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<String>,
    pub owner_id: Option<String>,
    pub claim_expires_at: Option<Timestamp>,
    pub superseded_cluster_ids: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

fn non_negative(column: &str, value: i32) -> Result<u32, CoreError> {
    u32::try_from(value)
        .map_err(|_| CoreError::Internal(format!("job_records.{column} is negative: {value}")))
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = CoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            fingerprint: Fingerprint::from_stored(row.fingerprint),
            job_id: row.job_id,
            cluster_id: row.cluster_id,
            state: JobState::from_id(row.state_id)?,
            attempts: non_negative("attempts", row.attempts)?,
            generation: non_negative("generation", row.generation)?,
            source: ObjectRef::new(row.source_container, row.source_key),
            content_version: row.content_version,
            warnings: row.warnings,
            last_error: row.last_error,
            failure_kind: row.failure_kind.as_deref().map(FailureKind::parse).transpose()?,
            owner_id: row.owner_id,
            claim_expires_at: row.claim_expires_at,
            superseded_cluster_ids: row.superseded_cluster_ids,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
