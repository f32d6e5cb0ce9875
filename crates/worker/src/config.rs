//! Worker configuration, loaded once at startup from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clusterflow_cluster::ClusterManagerConfig;
use clusterflow_core::job_spec::{FailurePolicy, InstanceTopology, JobTemplate, StepSpec};
use clusterflow_core::retry::RetryPolicy;
use clusterflow_core::storage_keys::DEFAULT_OUTPUT_PREFIX;
use clusterflow_core::CoreError;
use clusterflow_pipeline::{
    CompletionHandlerConfig, DispatcherConfig, ReceiveSettings, ReconcilerConfig,
};
use validator::Validate;

/// Which consumers this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Dispatcher,
    Completion,
}

impl Role {
    /// The dispatcher role also hosts the cluster manager and the
    /// reconciliation sweep.
    pub fn runs_dispatcher(self) -> bool {
        matches!(self, Self::All | Self::Dispatcher)
    }

    pub fn runs_completion(self) -> bool {
        matches!(self, Self::All | Self::Completion)
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "dispatcher" => Ok(Self::Dispatcher),
            "completion" => Ok(Self::Completion),
            other => Err(CoreError::Validation(format!(
                "CLUSTERFLOW_ROLE must be one of all, dispatcher, completion (got '{other}')"
            ))),
        }
    }
}

/// SQS queue URLs. Either all three are set or none is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueUrls {
    pub ingest: String,
    pub completion: String,
    pub dead_letter: String,
}

#[derive(Debug, Clone, Validate)]
pub struct WorkerConfig {
    pub role: Role,
    /// Recorded as the owner of submission claims and clusters, and
    /// heartbeated by the reconciler. Unique per running process.
    #[validate(length(min = 1, max = 128))]
    pub instance_id: String,
    /// `None` selects the in-memory registry.
    pub database_url: Option<String>,
    /// `None` selects in-memory queues.
    pub queues: Option<QueueUrls>,

    #[validate(length(min = 3, max = 63))]
    pub destination_bucket: String,
    pub output_prefix: String,

    #[validate(length(min = 1))]
    pub master_instance_type: String,
    #[validate(length(min = 1))]
    pub core_instance_type: String,
    #[validate(range(min = 1, max = 256))]
    pub core_instance_count: u32,
    #[validate(length(min = 1))]
    pub release_label: String,
    pub log_uri: String,
    #[validate(length(min = 1))]
    pub steps: Vec<StepSpec>,

    #[validate(range(min = 1, max = 900))]
    pub submission_timeout_secs: u64,
    #[validate(range(min = 1, max = 100))]
    pub max_dispatch_attempts: u32,
    #[validate(range(min = 60))]
    pub max_run_duration_secs: u64,
    #[validate(range(max = 10))]
    pub max_resubmissions: u32,

    #[validate(range(min = 1))]
    pub retry_initial_backoff_secs: u64,
    #[validate(range(min = 1, max = 43200))]
    pub retry_max_backoff_secs: u64,
    #[validate(range(min = 1.0, max = 10.0))]
    pub retry_backoff_multiplier: f64,

    #[validate(range(min = 1, max = 10))]
    pub receive_batch_size: u32,
    #[validate(range(max = 20))]
    pub receive_wait_secs: u64,
    #[validate(range(min = 1, max = 43200))]
    pub visibility_timeout_secs: u64,

    #[validate(range(min = 1))]
    pub retention_days: u32,
    #[validate(range(min = 10))]
    pub reconcile_interval_secs: u64,
    pub cluster_work_dir: PathBuf,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                      | Default                           |
    /// |------------------------------|-----------------------------------|
    /// | `CLUSTERFLOW_ROLE`           | `all`                             |
    /// | `CLUSTERFLOW_INSTANCE_ID`    | `$HOSTNAME`, else `worker-<uuid>` |
    /// | `DATABASE_URL`               | unset (in-memory registry)        |
    /// | `INGEST_QUEUE_URL`           | unset (in-memory queues)          |
    /// | `COMPLETION_QUEUE_URL`       | unset                             |
    /// | `DEAD_LETTER_QUEUE_URL`      | unset                             |
    /// | `DESTINATION_BUCKET`         | required                          |
    /// | `OUTPUT_PREFIX`              | `results`                         |
    /// | `MASTER_INSTANCE_TYPE`       | `m5.xlarge`                       |
    /// | `CORE_INSTANCE_TYPE`         | `m5.xlarge`                       |
    /// | `CORE_INSTANCE_COUNT`        | `2`                               |
    /// | `RELEASE_LABEL`              | `emr-6.7.0`                       |
    /// | `LOG_URI`                    | `s3://<bucket>/emr-logs/`         |
    /// | `STEPS_FILE`                 | unset (single `process` step)     |
    /// | `SUBMISSION_TIMEOUT_SECS`    | `30`                              |
    /// | `MAX_DISPATCH_ATTEMPTS`      | `3`                               |
    /// | `MAX_RUN_DURATION_SECS`      | `3600`                            |
    /// | `MAX_RESUBMISSIONS`          | `1`                               |
    /// | `RETRY_INITIAL_BACKOFF_SECS` | `5`                               |
    /// | `RETRY_MAX_BACKOFF_SECS`     | `300`                             |
    /// | `RETRY_BACKOFF_MULTIPLIER`   | `2.0`                             |
    /// | `RECEIVE_BATCH_SIZE`         | `10`                              |
    /// | `RECEIVE_WAIT_SECS`          | `20`                              |
    /// | `VISIBILITY_TIMEOUT_SECS`    | `60`                              |
    /// | `RETENTION_DAYS`             | `30`                              |
    /// | `RECONCILE_INTERVAL_SECS`    | `300`                             |
    /// | `CLUSTER_WORK_DIR`           | `/tmp/clusterflow`                |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// or `None` when it is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let role = match var("CLUSTERFLOW_ROLE") {
            Some(value) => value.parse()?,
            None => Role::All,
        };

        let queues = match (
            var("INGEST_QUEUE_URL"),
            var("COMPLETION_QUEUE_URL"),
            var("DEAD_LETTER_QUEUE_URL"),
        ) {
            (Some(ingest), Some(completion), Some(dead_letter)) => Some(QueueUrls {
                ingest,
                completion,
                dead_letter,
            }),
            (None, None, None) => None,
            _ => {
                return Err(CoreError::Validation(
                    "INGEST_QUEUE_URL, COMPLETION_QUEUE_URL and DEAD_LETTER_QUEUE_URL must be set together".into(),
                ))
            }
        };

        let destination_bucket = var("DESTINATION_BUCKET")
            .ok_or_else(|| CoreError::Validation("DESTINATION_BUCKET must be set".into()))?;
        let log_uri = var("LOG_URI").unwrap_or_else(|| format!("s3://{destination_bucket}/emr-logs/"));

        let steps = match var("STEPS_FILE") {
            Some(path) => load_steps(&path)?,
            None => default_steps(),
        };

        let instance_id = var("CLUSTERFLOW_INSTANCE_ID")
            .or_else(|| var("HOSTNAME"))
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::now_v7()));

        let config = Self {
            role,
            instance_id,
            database_url: var("DATABASE_URL"),
            queues,
            output_prefix: var("OUTPUT_PREFIX").unwrap_or_else(|| DEFAULT_OUTPUT_PREFIX.into()),
            master_instance_type: var("MASTER_INSTANCE_TYPE").unwrap_or_else(|| "m5.xlarge".into()),
            core_instance_type: var("CORE_INSTANCE_TYPE").unwrap_or_else(|| "m5.xlarge".into()),
            core_instance_count: parse(&var, "CORE_INSTANCE_COUNT", 2)?,
            release_label: var("RELEASE_LABEL").unwrap_or_else(|| "emr-6.7.0".into()),
            log_uri,
            steps,
            submission_timeout_secs: parse(&var, "SUBMISSION_TIMEOUT_SECS", 30)?,
            max_dispatch_attempts: parse(&var, "MAX_DISPATCH_ATTEMPTS", 3)?,
            max_run_duration_secs: parse(&var, "MAX_RUN_DURATION_SECS", 3600)?,
            max_resubmissions: parse(&var, "MAX_RESUBMISSIONS", 1)?,
            retry_initial_backoff_secs: parse(&var, "RETRY_INITIAL_BACKOFF_SECS", 5)?,
            retry_max_backoff_secs: parse(&var, "RETRY_MAX_BACKOFF_SECS", 300)?,
            retry_backoff_multiplier: parse(&var, "RETRY_BACKOFF_MULTIPLIER", 2.0)?,
            receive_batch_size: parse(&var, "RECEIVE_BATCH_SIZE", 10)?,
            receive_wait_secs: parse(&var, "RECEIVE_WAIT_SECS", 20)?,
            visibility_timeout_secs: parse(&var, "VISIBILITY_TIMEOUT_SECS", 60)?,
            retention_days: parse(&var, "RETENTION_DAYS", 30)?,
            reconcile_interval_secs: parse(&var, "RECONCILE_INTERVAL_SECS", 300)?,
            cluster_work_dir: var("CLUSTER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/clusterflow")),
            destination_bucket,
        };
        config.check()?;
        Ok(config)
    }

    /// Field validation plus the checks that span several fields.
    fn check(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(format!("Invalid worker configuration: {e}")))?;

        if self.retry_initial_backoff_secs > self.retry_max_backoff_secs {
            return Err(CoreError::Validation(
                "RETRY_INITIAL_BACKOFF_SECS must not exceed RETRY_MAX_BACKOFF_SECS".into(),
            ));
        }
        if self.queues.is_none() && self.role != Role::All {
            return Err(CoreError::Validation(format!(
                "CLUSTERFLOW_ROLE={:?} needs shared queues; set the *_QUEUE_URL variables",
                self.role
            )));
        }
        if let Some(step) = self.steps.iter().find(|s| s.command.trim().is_empty()) {
            return Err(CoreError::Validation(format!(
                "Step '{}' in STEPS_FILE has an empty command",
                step.name
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_dispatch_attempts,
            initial_backoff: Duration::from_secs(self.retry_initial_backoff_secs),
            max_backoff: Duration::from_secs(self.retry_max_backoff_secs),
            multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn topology(&self) -> InstanceTopology {
        InstanceTopology::standard(
            self.master_instance_type.clone(),
            self.core_instance_type.clone(),
            self.core_instance_count,
            self.release_label.clone(),
            Some(self.log_uri.clone()),
        )
    }

    pub fn template(&self) -> JobTemplate {
        JobTemplate {
            destination_bucket: self.destination_bucket.clone(),
            output_prefix: self.output_prefix.clone(),
            topology: self.topology(),
            steps: self.steps.clone(),
        }
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_duration_secs)
    }

    pub fn cluster_manager_config(&self) -> ClusterManagerConfig {
        ClusterManagerConfig {
            submission_timeout: Duration::from_secs(self.submission_timeout_secs),
            max_run_duration: self.max_run_duration(),
            terminal_retention: self.cluster_retention(),
            ..Default::default()
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            retry: self.retry_policy(),
            max_resubmissions: self.max_resubmissions,
            instance_id: self.instance_id.clone(),
            claim_ttl: self.claim_ttl(),
        }
    }

    /// Submission lease: long enough for one bounded `create` call and the
    /// registry write that follows it.
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs * 2)
    }

    pub fn completion_config(&self) -> CompletionHandlerConfig {
        CompletionHandlerConfig {
            max_resubmissions: self.max_resubmissions,
            retry: self.retry_policy(),
            ..Default::default()
        }
    }

    pub fn receive_settings(&self) -> ReceiveSettings {
        ReceiveSettings {
            batch_size: self.receive_batch_size,
            wait: Duration::from_secs(self.receive_wait_secs),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// A `SUBMITTED` record older than this has outlived any cluster.
    pub fn reconcile_stale_after(&self) -> Duration {
        self.max_run_duration() + self.reconcile_interval()
    }

    /// Finished clusters stay describable until the reconciler has had the
    /// chance to settle any record whose completion event went missing.
    pub fn cluster_retention(&self) -> Duration {
        self.reconcile_stale_after() + self.reconcile_interval() * 2
    }

    /// Three missed heartbeats mark an instance as gone.
    pub fn owner_ttl(&self) -> Duration {
        self.reconcile_interval() * 3
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            instance_id: self.instance_id.clone(),
            interval: self.reconcile_interval(),
            stale_after: self.reconcile_stale_after(),
            owner_ttl: self.owner_ttl(),
        }
    }
}

fn parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, CoreError> {
    match var(name) {
        Some(value) => value.trim().parse().map_err(|_| {
            CoreError::Validation(format!("{name} has an invalid value '{value}'"))
        }),
        None => Ok(default),
    }
}

fn load_steps(path: &str) -> Result<Vec<StepSpec>, CoreError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Validation(format!("STEPS_FILE {path} could not be read: {e}")))?;
    serde_json::from_str(&raw)
        .map_err(|e| CoreError::Validation(format!("STEPS_FILE {path} is not a valid step list: {e}")))
}

fn default_steps() -> Vec<StepSpec> {
    vec![StepSpec::new(
        "process",
        "spark-submit",
        vec![
            "--deploy-mode".into(),
            "cluster".into(),
            "s3://{container}/{key}".into(),
            "{destination}".into(),
        ],
        FailurePolicy::Terminate,
    )]
}
