//! In-process [`JobRegistry`] for tests and single-process local runs.
//!
//! A single `RwLock` around the map makes every operation atomic, which gives
//! the same CAS semantics as the Postgres implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use clusterflow_core::{
    Fingerprint, JobId, JobRecord, JobState, NewJobRecord, Timestamp, TransitionFields,
};
use tokio::sync::RwLock;

use crate::registry::{ensure_forward, CasOutcome, JobRegistry, RegistryError, TryCreateOutcome};

#[derive(Default)]
pub struct InMemoryJobRegistry {
    records: RwLock<HashMap<Fingerprint, JobRecord>>,
    heartbeats: RwLock<HashMap<String, Timestamp>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Snapshot of all records.
    pub async fn all(&self) -> Vec<JobRecord> {
        self.records.read().await.values().cloned().collect()
    }

    async fn find(&self, pred: impl Fn(&JobRecord) -> bool) -> Option<JobRecord> {
        self.records.read().await.values().find(|r| pred(r)).cloned()
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn try_create(&self, new: NewJobRecord) -> Result<TryCreateOutcome, RegistryError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&new.fingerprint) {
            return Ok(TryCreateOutcome {
                created: false,
                record: existing.clone(),
            });
        }
        let record = JobRecord::from_new(new, Utc::now());
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(TryCreateOutcome {
            created: true,
            record,
        })
    }

    async fn transition(
        &self,
        fingerprint: &Fingerprint,
        from: JobState,
        to: JobState,
        fields: TransitionFields,
    ) -> Result<CasOutcome, RegistryError> {
        ensure_forward(from, to)?;
        let mut records = self.records.write().await;
        match records.get_mut(fingerprint) {
            Some(record) if record.state == from => {
                record.apply_transition(to, fields, Utc::now())?;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.records.read().await.get(fingerprint).cloned())
    }

    async fn get_by_job_id(&self, job_id: &str) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.find(|r| r.job_id == job_id).await)
    }

    async fn get_by_cluster_id(
        &self,
        cluster_id: &str,
    ) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self
            .find(|r| {
                r.cluster_id.as_deref() == Some(cluster_id) || r.is_superseded_cluster(cluster_id)
            })
            .await)
    }

    async fn claim_submission(
        &self,
        fingerprint: &Fingerprint,
        job_id: &str,
        owner: &str,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<CasOutcome, RegistryError> {
        let mut records = self.records.write().await;
        match records.get_mut(fingerprint) {
            Some(record)
                if record.state == JobState::Pending
                    && record.job_id == job_id
                    && record.claimable_by(owner, now) =>
            {
                record.claim(owner, expires_at, now);
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        error: &str,
    ) -> Result<Option<u32>, RegistryError> {
        let mut records = self.records.write().await;
        match records.get_mut(fingerprint) {
            Some(record) if record.state == JobState::Pending => {
                record.attempts += 1;
                record.last_error = Some(error.to_string());
                record.release_claim();
                record.updated_at = Utc::now();
                Ok(Some(record.attempts))
            }
            _ => Ok(None),
        }
    }

    async fn reopen(
        &self,
        fingerprint: &Fingerprint,
        expected_generation: u32,
        new_job_id: &JobId,
    ) -> Result<CasOutcome, RegistryError> {
        let mut records = self.records.write().await;
        match records.get_mut(fingerprint) {
            Some(record)
                if record.state == JobState::Failed
                    && record.generation == expected_generation =>
            {
                record.reopen(new_job_id.clone(), Utc::now())?;
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn list_stale(
        &self,
        state: JobState,
        updated_before: Timestamp,
        limit: i64,
    ) -> Result<Vec<JobRecord>, RegistryError> {
        let records = self.records.read().await;
        let mut stale: Vec<JobRecord> = records
            .values()
            .filter(|r| r.state == state && r.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<u64, RegistryError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !(r.state.is_terminal() && r.updated_at < cutoff));
        Ok((before - records.len()) as u64)
    }

    async fn heartbeat(&self, instance_id: &str, at: Timestamp) -> Result<(), RegistryError> {
        self.heartbeats.write().await.insert(instance_id.to_string(), at);
        Ok(())
    }

    async fn last_heartbeat(
        &self,
        instance_id: &str,
    ) -> Result<Option<Timestamp>, RegistryError> {
        Ok(self.heartbeats.read().await.get(instance_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::Duration;
    use clusterflow_core::job_spec::job_id_for;
    use clusterflow_core::{CoreError, ObjectRef};

    use super::*;

    fn new_record(key: &str) -> NewJobRecord {
        let source = ObjectRef::new("source-bucket", key);
        let fingerprint = Fingerprint::compute(&source, "v1");
        NewJobRecord {
            job_id: job_id_for(&fingerprint, 0),
            fingerprint,
            source,
            content_version: "v1".into(),
        }
    }

    #[tokio::test]
    async fn try_create_is_first_writer_wins() {
        let registry = InMemoryJobRegistry::new();
        let first = registry.try_create(new_record("data/input1.csv")).await.unwrap();
        let second = registry.try_create(new_record("data/input1.csv")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.record.job_id, first.record.job_id);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_creates_yield_one_record() {
        let registry = Arc::new(InMemoryJobRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.try_create(new_record("data/input1.csv")).await.unwrap().created
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let registry = InMemoryJobRegistry::new();
        let record = registry.try_create(new_record("a.csv")).await.unwrap().record;
        let fp = record.fingerprint.clone();

        let applied = registry
            .transition(
                &fp,
                JobState::Pending,
                JobState::Submitted,
                TransitionFields::none().with_cluster_id("c-1"),
            )
            .await
            .unwrap();
        assert_eq!(applied, CasOutcome::Applied);

        let stale = registry
            .transition(&fp, JobState::Pending, JobState::Submitted, TransitionFields::none())
            .await
            .unwrap();
        assert_eq!(stale, CasOutcome::Conflict);

        let by_cluster = registry.get_by_cluster_id("c-1").await.unwrap().unwrap();
        assert_eq!(by_cluster.state, JobState::Submitted);
        assert_eq!(
            registry.get_by_job_id(&record.job_id).await.unwrap().unwrap().fingerprint,
            fp
        );
    }

    #[tokio::test]
    async fn backward_transition_is_rejected() {
        let registry = InMemoryJobRegistry::new();
        let fp = registry.try_create(new_record("a.csv")).await.unwrap().record.fingerprint;
        let result = registry
            .transition(&fp, JobState::Succeeded, JobState::Pending, TransitionFields::none())
            .await;
        assert_matches!(result, Err(RegistryError::Core(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn record_attempt_only_counts_pending() {
        let registry = InMemoryJobRegistry::new();
        let fp = registry.try_create(new_record("a.csv")).await.unwrap().record.fingerprint;

        assert_eq!(registry.record_attempt(&fp, "timeout").await.unwrap(), Some(1));
        assert_eq!(registry.record_attempt(&fp, "timeout").await.unwrap(), Some(2));

        registry
            .transition(&fp, JobState::Pending, JobState::Failed, TransitionFields::none())
            .await
            .unwrap();
        assert_eq!(registry.record_attempt(&fp, "timeout").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reopen_starts_next_generation_once() {
        let registry = InMemoryJobRegistry::new();
        let fp = registry.try_create(new_record("a.csv")).await.unwrap().record.fingerprint;
        registry.record_attempt(&fp, "boom").await.unwrap();
        registry
            .transition(
                &fp,
                JobState::Pending,
                JobState::Failed,
                TransitionFields::none().with_error("boom"),
            )
            .await
            .unwrap();

        let next_id = job_id_for(&fp, 1);
        assert!(registry.reopen(&fp, 0, &next_id).await.unwrap().is_applied());
        assert!(!registry.reopen(&fp, 0, &next_id).await.unwrap().is_applied());

        let record = registry.get(&fp).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.generation, 1);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.job_id, next_id);
        assert!(record.last_error.is_none());
    }

    async fn claim(
        registry: &InMemoryJobRegistry,
        record: &JobRecord,
        owner: &str,
        at: Timestamp,
    ) -> CasOutcome {
        registry
            .claim_submission(
                &record.fingerprint,
                &record.job_id,
                owner,
                at,
                at + Duration::seconds(60),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submission_claim_admits_one_owner_at_a_time() {
        let registry = InMemoryJobRegistry::new();
        let record = registry.try_create(new_record("a.csv")).await.unwrap().record;
        let fp = record.fingerprint.clone();
        let now = Utc::now();
        let lease = now + Duration::seconds(60);

        assert!(claim(&registry, &record, "worker-a", now).await.is_applied());
        assert!(claim(&registry, &record, "worker-a", now).await.is_applied());
        assert_eq!(claim(&registry, &record, "worker-b", now).await, CasOutcome::Conflict);

        // Lapsed claims can be taken over.
        let later = lease + Duration::seconds(1);
        assert!(claim(&registry, &record, "worker-b", later).await.is_applied());
        let held = registry.get(&fp).await.unwrap().unwrap();
        assert_eq!(held.owner_id.as_deref(), Some("worker-b"));

        // A failed attempt releases the claim.
        registry.record_attempt(&fp, "timeout").await.unwrap();
        assert!(claim(&registry, &record, "worker-a", now).await.is_applied());

        // Wrong job id or a non-pending record never claims.
        let wrong = registry
            .claim_submission(&fp, "other-job", "worker-a", now, lease)
            .await
            .unwrap();
        assert_eq!(wrong, CasOutcome::Conflict);
        registry
            .transition(
                &fp,
                JobState::Pending,
                JobState::Submitted,
                TransitionFields::none().with_cluster_id("c-1").with_owner("worker-a"),
            )
            .await
            .unwrap();
        assert_eq!(claim(&registry, &record, "worker-a", now).await, CasOutcome::Conflict);
        let submitted = registry.get(&fp).await.unwrap().unwrap();
        assert_eq!(submitted.owner_id.as_deref(), Some("worker-a"));
        assert!(submitted.claim_expires_at.is_none());
    }

    #[tokio::test]
    async fn earlier_generation_cluster_ids_still_resolve() {
        let registry = InMemoryJobRegistry::new();
        let fp = registry.try_create(new_record("a.csv")).await.unwrap().record.fingerprint;
        registry
            .transition(
                &fp,
                JobState::Pending,
                JobState::Submitted,
                TransitionFields::none().with_cluster_id("c-1"),
            )
            .await
            .unwrap();
        registry
            .transition(&fp, JobState::Submitted, JobState::Failed, TransitionFields::none())
            .await
            .unwrap();
        registry.reopen(&fp, 0, &job_id_for(&fp, 1)).await.unwrap();

        let record = registry.get_by_cluster_id("c-1").await.unwrap().unwrap();
        assert_eq!(record.fingerprint, fp);
        assert!(record.cluster_id.is_none());
        assert!(registry.get_by_cluster_id("c-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeats_keep_the_latest_write() {
        let registry = InMemoryJobRegistry::new();
        assert!(registry.last_heartbeat("worker-a").await.unwrap().is_none());

        let at = Utc::now();
        registry.heartbeat("worker-a", at - Duration::minutes(5)).await.unwrap();
        registry.heartbeat("worker-a", at).await.unwrap();
        assert_eq!(registry.last_heartbeat("worker-a").await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn purge_keeps_non_terminal_records() {
        let registry = InMemoryJobRegistry::new();
        let done = registry.try_create(new_record("a.csv")).await.unwrap().record.fingerprint;
        registry.try_create(new_record("b.csv")).await.unwrap();
        registry
            .transition(&done, JobState::Pending, JobState::Failed, TransitionFields::none())
            .await
            .unwrap();

        let purged = registry
            .purge_terminal_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&done).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_stale_filters_by_state_and_age() {
        let registry = InMemoryJobRegistry::new();
        let fp = registry.try_create(new_record("a.csv")).await.unwrap().record.fingerprint;
        registry
            .transition(&fp, JobState::Pending, JobState::Submitted, TransitionFields::none())
            .await
            .unwrap();

        let future = Utc::now() + Duration::seconds(1);
        let past = Utc::now() - Duration::hours(1);
        assert_eq!(registry.list_stale(JobState::Submitted, future, 10).await.unwrap().len(), 1);
        assert!(registry.list_stale(JobState::Submitted, past, 10).await.unwrap().is_empty());
        assert!(registry.list_stale(JobState::Pending, future, 10).await.unwrap().is_empty());
    }
}
