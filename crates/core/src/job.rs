//! Job Registry records and their state machine.
//!
//! A [`JobRecord`] is keyed by [`Fingerprint`] and moves strictly forward:
//! `PENDING -> SUBMITTED -> {SUCCEEDED | FAILED}` (a pending record may also
//! fail directly when submission is abandoned). The only way back is
//! [`JobRecord::reopen`], which starts a new generation with a new job id.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::fingerprint::Fingerprint;
use crate::types::{ClusterId, JobId, ObjectRef, Timestamp};

/// Persisted job state. Discriminants match the `job_record_states` seed data.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending = 1,
    Submitted = 2,
    Succeeded = 3,
    Failed = 4,
}

impl JobState {
    /// Return the database state ID.
    pub fn id(self) -> i16 {
        self as i16
    }

    pub fn from_id(id: i16) -> Result<Self, CoreError> {
        match id {
            1 => Ok(Self::Pending),
            2 => Ok(Self::Submitted),
            3 => Ok(Self::Succeeded),
            4 => Ok(Self::Failed),
            other => Err(CoreError::Validation(format!("Unknown job state id {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is a forward transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Submitted)
                | (Self::Pending, Self::Failed)
                | (Self::Submitted, Self::Succeeded)
                | (Self::Submitted, Self::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record ended `FAILED`. Only non-permanent failures are reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The input or its job spec can never be submitted.
    Permanent,
    /// Transient submission errors used up the attempt budget.
    SubmissionExhausted,
    /// The cluster ran and failed, or was lost.
    Cluster,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "PERMANENT",
            Self::SubmissionExhausted => "SUBMISSION_EXHAUSTED",
            Self::Cluster => "CLUSTER",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "PERMANENT" => Ok(Self::Permanent),
            "SUBMISSION_EXHAUSTED" => Ok(Self::SubmissionExhausted),
            "CLUSTER" => Ok(Self::Cluster),
            other => Err(CoreError::Validation(format!("Unknown failure kind {other}"))),
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to create a record via insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobRecord {
    pub fingerprint: Fingerprint,
    pub job_id: JobId,
    pub source: ObjectRef,
    pub content_version: String,
}

/// One record per fingerprint, ever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub fingerprint: Fingerprint,
    pub job_id: JobId,
    pub cluster_id: Option<ClusterId>,
    pub state: JobState,
    /// Failed submission attempts in the current generation.
    pub attempts: u32,
    /// Number of times the record was reopened after failing.
    pub generation: u32,
    pub source: ObjectRef,
    pub content_version: String,
    /// Non-fatal step failures reported by the cluster.
    pub warnings: Vec<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Worker instance holding the submission claim, then owning the cluster.
    pub owner_id: Option<String>,
    /// End of the submission lease while `PENDING`.
    pub claim_expires_at: Option<Timestamp>,
    /// Cluster ids of earlier generations, oldest first.
    pub superseded_cluster_ids: Vec<ClusterId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Optional field updates applied together with a state transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub cluster_id: Option<ClusterId>,
    pub last_error: Option<String>,
    pub warnings: Vec<String>,
    pub failure_kind: Option<FailureKind>,
    pub owner_id: Option<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_cluster_id(mut self, cluster_id: impl Into<ClusterId>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_failure(mut self, kind: FailureKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

impl JobRecord {
    /// A fresh `PENDING` record for generation 0.
    pub fn from_new(new: NewJobRecord, now: Timestamp) -> Self {
        Self {
            fingerprint: new.fingerprint,
            job_id: new.job_id,
            cluster_id: None,
            state: JobState::Pending,
            attempts: 0,
            generation: 0,
            source: new.source,
            content_version: new.content_version,
            warnings: Vec::new(),
            last_error: None,
            failure_kind: None,
            owner_id: None,
            claim_expires_at: None,
            superseded_cluster_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Whether `cluster_id` ran an earlier generation of this record.
    pub fn is_superseded_cluster(&self, cluster_id: &str) -> bool {
        self.superseded_cluster_ids.iter().any(|id| id == cluster_id)
    }

    /// Whether `owner` may take the submission claim at `now`: the record is
    /// unclaimed, already claimed by `owner`, or the other claim has lapsed.
    pub fn claimable_by(&self, owner: &str, now: Timestamp) -> bool {
        match (&self.owner_id, self.claim_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == owner => true,
            (Some(_), Some(expires_at)) => expires_at <= now,
            (Some(_), None) => true,
        }
    }

    /// Take the submission claim. Caller has checked [`Self::claimable_by`].
    pub fn claim(&mut self, owner: &str, expires_at: Timestamp, now: Timestamp) {
        self.owner_id = Some(owner.to_string());
        self.claim_expires_at = Some(expires_at);
        self.updated_at = now;
    }

    /// Drop the submission claim so another dispatcher can retry at once.
    pub fn release_claim(&mut self) {
        self.owner_id = None;
        self.claim_expires_at = None;
    }

    /// Apply a forward transition. The caller has already checked that the
    /// current state equals the expected `from` state.
    pub fn apply_transition(
        &mut self,
        to: JobState,
        fields: TransitionFields,
        now: Timestamp,
    ) -> Result<(), CoreError> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::Validation(format!(
                "Illegal job state transition {} -> {}",
                self.state, to
            )));
        }
        self.state = to;
        if let Some(cluster_id) = fields.cluster_id {
            self.cluster_id = Some(cluster_id);
        }
        if let Some(error) = fields.last_error {
            self.last_error = Some(error);
        }
        if !fields.warnings.is_empty() {
            self.warnings = fields.warnings;
        }
        if let Some(kind) = fields.failure_kind {
            self.failure_kind = Some(kind);
        }
        if let Some(owner_id) = fields.owner_id {
            self.owner_id = Some(owner_id);
        }
        self.claim_expires_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Start a new generation of a `FAILED` record. The old cluster id moves
    /// to `superseded_cluster_ids` so late events for it can still be matched.
    pub fn reopen(&mut self, job_id: JobId, now: Timestamp) -> Result<(), CoreError> {
        if self.state != JobState::Failed {
            return Err(CoreError::Validation(format!(
                "Only FAILED records can be reopened, record is {}",
                self.state
            )));
        }
        self.state = JobState::Pending;
        self.job_id = job_id;
        self.generation += 1;
        self.attempts = 0;
        if let Some(cluster_id) = self.cluster_id.take() {
            self.superseded_cluster_ids.push(cluster_id);
        }
        self.last_error = None;
        self.failure_kind = None;
        self.release_claim();
        self.warnings.clear();
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;

    fn pending() -> JobRecord {
        let source = ObjectRef::new("source-bucket", "data/input1.csv");
        JobRecord::from_new(
            NewJobRecord {
                fingerprint: Fingerprint::compute(&source, "v1"),
                job_id: "job-1".into(),
                source,
                content_version: "v1".into(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn state_ids_round_trip() {
        for state in [
            JobState::Pending,
            JobState::Submitted,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_id(state.id()).unwrap(), state);
        }
        assert_matches!(JobState::from_id(9), Err(CoreError::Validation(_)));
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        assert!(JobState::Pending.can_transition_to(JobState::Submitted));
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
        assert!(JobState::Submitted.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Submitted.can_transition_to(JobState::Pending));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Submitted));
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn transition_applies_fields() {
        let mut record = pending();
        record
            .apply_transition(
                JobState::Submitted,
                TransitionFields::none().with_cluster_id("j-1"),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.cluster_id.as_deref(), Some("j-1"));

        record
            .apply_transition(
                JobState::Succeeded,
                TransitionFields::none().with_warnings(vec!["clean: exit 1".into()]),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert!(record.has_warnings());
        assert_eq!(record.cluster_id.as_deref(), Some("j-1"));
    }

    #[test]
    fn backward_transition_is_rejected() {
        let mut record = pending();
        record
            .apply_transition(JobState::Failed, TransitionFields::none(), Utc::now())
            .unwrap();
        let err = record
            .apply_transition(JobState::Submitted, TransitionFields::none(), Utc::now())
            .unwrap_err();
        assert_matches!(err, CoreError::Validation(_));
        assert_eq!(record.state, JobState::Failed);
    }

    #[test]
    fn reopen_starts_a_new_generation() {
        let mut record = pending();
        record.attempts = 3;
        record
            .apply_transition(
                JobState::Failed,
                TransitionFields::none().with_error("timeout"),
                Utc::now(),
            )
            .unwrap();

        record.reopen("job-2".into(), Utc::now()).unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.generation, 1);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.job_id, "job-2");
        assert!(record.last_error.is_none());
    }

    #[test]
    fn reopen_keeps_previous_cluster_ids() {
        let mut record = pending();
        record
            .apply_transition(
                JobState::Submitted,
                TransitionFields::none().with_cluster_id("j-1").with_owner("worker-a"),
                Utc::now(),
            )
            .unwrap();
        record
            .apply_transition(
                JobState::Failed,
                TransitionFields::none()
                    .with_error("step failed")
                    .with_failure(FailureKind::Cluster),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.failure_kind, Some(FailureKind::Cluster));

        record.reopen("job-2".into(), Utc::now()).unwrap();
        assert!(record.cluster_id.is_none());
        assert!(record.owner_id.is_none());
        assert!(record.failure_kind.is_none());
        assert_eq!(record.superseded_cluster_ids, vec!["j-1".to_string()]);
        assert!(record.is_superseded_cluster("j-1"));
        assert!(!record.is_superseded_cluster("j-2"));
    }

    #[test]
    fn claim_blocks_other_owners_until_it_lapses() {
        let now = Utc::now();
        let mut record = pending();
        assert!(record.claimable_by("worker-a", now));

        record.claim("worker-a", now + chrono::Duration::seconds(60), now);
        assert!(record.claimable_by("worker-a", now));
        assert!(!record.claimable_by("worker-b", now));
        assert!(record.claimable_by("worker-b", now + chrono::Duration::seconds(61)));

        record.release_claim();
        assert!(record.claimable_by("worker-b", now));
    }

    #[test]
    fn failure_kinds_parse() {
        for kind in [
            FailureKind::Permanent,
            FailureKind::SubmissionExhausted,
            FailureKind::Cluster,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(!FailureKind::Permanent.is_retryable());
        assert_matches!(FailureKind::parse("LOST"), Err(CoreError::Validation(_)));
    }

    #[test]
    fn reopen_requires_failed_state() {
        let mut record = pending();
        assert_matches!(
            record.reopen("job-2".into(), Utc::now()),
            Err(CoreError::Validation(_))
        );
    }
}
