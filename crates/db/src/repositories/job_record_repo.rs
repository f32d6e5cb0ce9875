//! Postgres-backed [`JobRegistry`] over the `job_records` table.
//!
//! Creation is `INSERT .. ON CONFLICT DO NOTHING`; every mutation is an
//! `UPDATE .. WHERE state_id = $expected` whose `rows_affected` decides the
//! CAS outcome.

use async_trait::async_trait;
use clusterflow_core::{
    Fingerprint, JobId, JobRecord, JobState, NewJobRecord, Timestamp, TransitionFields,
};

use crate::models::job_record::JobRecordRow;
use crate::registry::{ensure_forward, CasOutcome, JobRegistry, RegistryError, TryCreateOutcome};
use crate::DbPool;

/// Column list for `job_records` queries.
const COLUMNS: &str = "\
    fingerprint, job_id, cluster_id, state_id, attempts, generation, \
    source_container, source_key, content_version, warnings, last_error, \
    failure_kind, owner_id, claim_expires_at, superseded_cluster_ids, \
    created_at, updated_at";

const TERMINAL_STATES: [i16; 2] = [
    JobState::Succeeded as i16,
    JobState::Failed as i16,
];

#[derive(Clone)]
pub struct PgJobRegistry {
    pool: DbPool,
}

impl PgJobRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_by(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<JobRecord>, RegistryError> {
        let query = format!("SELECT {COLUMNS} FROM job_records WHERE {column} = $1");
        let row = sqlx::query_as::<_, JobRecordRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(JobRecord::try_from).transpose()?)
    }
}

#[async_trait]
impl JobRegistry for PgJobRegistry {
    async fn try_create(&self, new: NewJobRecord) -> Result<TryCreateOutcome, RegistryError> {
        let query = format!(
            "INSERT INTO job_records \
                 (fingerprint, job_id, state_id, source_container, source_key, content_version) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (fingerprint) DO NOTHING \
             RETURNING {COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, JobRecordRow>(&query)
            .bind(new.fingerprint.as_str())
            .bind(&new.job_id)
            .bind(JobState::Pending.id())
            .bind(&new.source.container)
            .bind(&new.source.key)
            .bind(&new.content_version)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Ok(TryCreateOutcome {
                created: true,
                record: row.try_into()?,
            });
        }

        // Lost the race (or a redelivery): the existing row wins.
        let existing = self
            .fetch_one_by("fingerprint", new.fingerprint.as_str())
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok(TryCreateOutcome {
            created: false,
            record: existing,
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
        let result = sqlx::query(
            "UPDATE job_records \
             SET state_id = $3, \
                 cluster_id = COALESCE($4, cluster_id), \
                 last_error = COALESCE($5, last_error), \
                 warnings = CASE WHEN cardinality($6::TEXT[]) > 0 THEN $6 ELSE warnings END, \
                 failure_kind = COALESCE($7, failure_kind), \
                 owner_id = COALESCE($8, owner_id), \
                 claim_expires_at = NULL \
             WHERE fingerprint = $1 AND state_id = $2",
        )
        .bind(fingerprint.as_str())
        .bind(from.id())
        .bind(to.id())
        .bind(fields.cluster_id)
        .bind(fields.last_error)
        .bind(fields.warnings)
        .bind(fields.failure_kind.map(|kind| kind.as_str()))
        .bind(fields.owner_id)
        .execute(&self.pool)
        .await?;

        let outcome = CasOutcome::from(result.rows_affected() == 1);
        if !outcome.is_applied() {
            tracing::debug!(
                fingerprint = %fingerprint,
                from = %from,
                to = %to,
                "Job record transition lost CAS"
            );
        }
        Ok(outcome)
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RegistryError> {
        self.fetch_one_by("fingerprint", fingerprint.as_str()).await
    }

    async fn get_by_job_id(&self, job_id: &str) -> Result<Option<JobRecord>, RegistryError> {
        self.fetch_one_by("job_id", job_id).await
    }

    async fn get_by_cluster_id(
        &self,
        cluster_id: &str,
    ) -> Result<Option<JobRecord>, RegistryError> {
        let query = format!(
            "SELECT {COLUMNS} FROM job_records \
             WHERE cluster_id = $1 OR $1 = ANY(superseded_cluster_ids) \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRecordRow>(&query)
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(JobRecord::try_from).transpose()?)
    }

    async fn claim_submission(
        &self,
        fingerprint: &Fingerprint,
        job_id: &str,
        owner: &str,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<CasOutcome, RegistryError> {
        let result = sqlx::query(
            "UPDATE job_records \
             SET owner_id = $4, claim_expires_at = $6 \
             WHERE fingerprint = $1 AND state_id = $2 AND job_id = $3 \
               AND (owner_id IS NULL OR owner_id = $4 \
                    OR claim_expires_at IS NULL OR claim_expires_at <= $5)",
        )
        .bind(fingerprint.as_str())
        .bind(JobState::Pending.id())
        .bind(job_id)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        let outcome = CasOutcome::from(result.rows_affected() == 1);
        if !outcome.is_applied() {
            tracing::debug!(
                fingerprint = %fingerprint,
                job_id,
                owner,
                "Submission claim held elsewhere"
            );
        }
        Ok(outcome)
    }

    async fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        error: &str,
    ) -> Result<Option<u32>, RegistryError> {
        let attempts: Option<(i32,)> = sqlx::query_as(
            "UPDATE job_records \
             SET attempts = attempts + 1, last_error = $3, \
                 owner_id = NULL, claim_expires_at = NULL \
             WHERE fingerprint = $1 AND state_id = $2 \
             RETURNING attempts",
        )
        .bind(fingerprint.as_str())
        .bind(JobState::Pending.id())
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts.map(|(n,)| n.max(0) as u32))
    }

    async fn reopen(
        &self,
        fingerprint: &Fingerprint,
        expected_generation: u32,
        new_job_id: &JobId,
    ) -> Result<CasOutcome, RegistryError> {
        let result = sqlx::query(
            "UPDATE job_records \
             SET state_id = $4, job_id = $5, generation = generation + 1, attempts = 0, \
                 superseded_cluster_ids = CASE WHEN cluster_id IS NULL \
                     THEN superseded_cluster_ids \
                     ELSE array_append(superseded_cluster_ids, cluster_id) END, \
                 cluster_id = NULL, last_error = NULL, warnings = '{}', \
                 failure_kind = NULL, owner_id = NULL, claim_expires_at = NULL \
             WHERE fingerprint = $1 AND state_id = $2 AND generation = $3",
        )
        .bind(fingerprint.as_str())
        .bind(JobState::Failed.id())
        .bind(expected_generation as i32)
        .bind(JobState::Pending.id())
        .bind(new_job_id)
        .execute(&self.pool)
        .await?;
        Ok(CasOutcome::from(result.rows_affected() == 1))
    }

    async fn list_stale(
        &self,
        state: JobState,
        updated_before: Timestamp,
        limit: i64,
    ) -> Result<Vec<JobRecord>, RegistryError> {
        let query = format!(
            "SELECT {COLUMNS} FROM job_records \
             WHERE state_id = $1 AND updated_at < $2 \
             ORDER BY updated_at ASC \
             LIMIT $3"
        );
        let rows = sqlx::query_as::<_, JobRecordRow>(&query)
            .bind(state.id())
            .bind(updated_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| JobRecord::try_from(row).map_err(RegistryError::from))
            .collect()
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> Result<u64, RegistryError> {
        let result = sqlx::query(
            "DELETE FROM job_records WHERE state_id = ANY($1) AND updated_at < $2",
        )
        .bind(&TERMINAL_STATES[..])
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn heartbeat(&self, instance_id: &str, at: Timestamp) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO worker_heartbeats (instance_id, last_seen_at) VALUES ($1, $2) \
             ON CONFLICT (instance_id) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(instance_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_heartbeat(
        &self,
        instance_id: &str,
    ) -> Result<Option<Timestamp>, RegistryError> {
        let row: Option<(Timestamp,)> =
            sqlx::query_as("SELECT last_seen_at FROM worker_heartbeats WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(at,)| at))
    }
}
