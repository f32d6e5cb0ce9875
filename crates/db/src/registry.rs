//! The [`JobRegistry`] contract.

use async_trait::async_trait;
use clusterflow_core::{
    CoreError, Fingerprint, JobId, JobRecord, JobState, NewJobRecord, Timestamp, TransitionFields,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub struct TryCreateOutcome {
    /// `true` when this call inserted the record.
    pub created: bool,
    /// The stored record: the new one, or whoever won the race.
    pub record: JobRecord,
}

/// Result of a compare-and-swap mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The record was not in the expected state (or does not exist).
    /// Callers re-read to find out what happened.
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

impl From<bool> for CasOutcome {
    fn from(applied: bool) -> Self {
        if applied {
            Self::Applied
        } else {
            Self::Conflict
        }
    }
}

/// Durable store of job records keyed by fingerprint.
///
/// Every mutation is conditional on the current state; there is no other
/// locking.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Insert a `PENDING` record unless one exists for the fingerprint.
    async fn try_create(&self, new: NewJobRecord) -> Result<TryCreateOutcome, RegistryError>;

    /// Move `from -> to`, applying `fields`, only if the record is in `from`.
    async fn transition(
        &self,
        fingerprint: &Fingerprint,
        from: JobState,
        to: JobState,
        fields: TransitionFields,
    ) -> Result<CasOutcome, RegistryError>;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RegistryError>;

    async fn get_by_job_id(&self, job_id: &str) -> Result<Option<JobRecord>, RegistryError>;

    /// Look up by the current cluster id or one from an earlier generation.
    async fn get_by_cluster_id(
        &self,
        cluster_id: &str,
    ) -> Result<Option<JobRecord>, RegistryError>;

    /// Take the submission lease on a `PENDING` record for `job_id`.
    ///
    /// Applied when the record is unclaimed, already held by `owner`, or the
    /// current claim expired before `now`. Only the holder may create a
    /// cluster for the job.
    async fn claim_submission(
        &self,
        fingerprint: &Fingerprint,
        job_id: &str,
        owner: &str,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<CasOutcome, RegistryError>;

    /// Count a failed submission attempt on a `PENDING` record and release
    /// its submission claim.
    ///
    /// Returns the new attempt count, or `None` if the record is no longer
    /// pending.
    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        error: &str,
    ) -> Result<Option<u32>, RegistryError>;

    /// Start a new generation of a `FAILED` record (`FAILED -> PENDING`).
    ///
    /// Conditional on both the state and `expected_generation`, so two
    /// dispatchers racing on the same redelivery reopen it only once.
    async fn reopen(
        &self,
        fingerprint: &Fingerprint,
        expected_generation: u32,
        new_job_id: &JobId,
    ) -> Result<CasOutcome, RegistryError>;

    /// Records in `state` not updated since `updated_before`, oldest first.
    async fn list_stale(
        &self,
        state: JobState,
        updated_before: Timestamp,
        limit: i64,
    ) -> Result<Vec<JobRecord>, RegistryError>;

    /// Delete terminal records not updated since `cutoff`. Returns the count.
    async fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<u64, RegistryError>;

    /// Record that worker `instance_id` was alive at `at`.
    async fn heartbeat(&self, instance_id: &str, at: Timestamp) -> Result<(), RegistryError>;

    async fn last_heartbeat(&self, instance_id: &str)
        -> Result<Option<Timestamp>, RegistryError>;
}

/// Reject transitions the state machine does not allow before touching
/// storage.
pub(crate) fn ensure_forward(from: JobState, to: JobState) -> Result<(), RegistryError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!("Illegal job state transition {from} -> {to}")).into())
    }
}
