//! Shared wiring for the pipeline integration tests.
//!
//! Everything runs in-process: in-memory registry, queues and object store,
//! and a scripted cluster backend whose behaviour each test configures.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use clusterflow_cloud::{InMemoryObjectStore, InMemoryQueue, MessageQueue};
use clusterflow_cluster::{
    BackendError, ClusterBackend, ClusterManager, ClusterManagerConfig, QueueCompletionPublisher,
};
use clusterflow_core::job_spec::{FailurePolicy, InstanceTopology, JobSpec, JobTemplate, StepSpec};
use clusterflow_core::messages::IngestionNotification;
use clusterflow_core::retry::RetryPolicy;
use clusterflow_core::{ClusterId, JobRecord, ObjectRef};
use clusterflow_db::{InMemoryJobRegistry, JobRegistry};
use clusterflow_events::{DeadLetterChannel, DeadLetterRecord, EventBus, OrchestratorEvent};
use clusterflow_pipeline::{
    CompletionHandler, CompletionHandlerConfig, Dispatcher, DispatcherConfig, JobResult,
    QueueConsumer, ReceiveSettings,
};
use tokio::sync::broadcast;

pub const DESTINATION_BUCKET: &str = "dest-bucket";
pub const OUTPUT_PREFIX: &str = "results";
pub const MAX_DISPATCH_ATTEMPTS: u32 = 3;
pub const MAX_UNKNOWN_RECEIVES: u32 = 3;
/// Worker instance the harness dispatcher runs as.
pub const INSTANCE_ID: &str = "worker-a";
pub const CLAIM_TTL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// Cluster service double. Steps succeed unless named in `failing_steps`.
#[derive(Default)]
pub struct ScriptedBackend {
    pub failing_steps: HashSet<String>,
    /// Source keys whose submissions the service rejects as invalid.
    pub rejected_keys: HashSet<String>,
    /// Delay before `create` answers; longer than the submission timeout
    /// means no cluster is ever created.
    pub create_delay: Option<Duration>,
    pub hang_steps: bool,
    pub creates: AtomicU32,
    pub executed: Mutex<Vec<(ClusterId, String)>>,
}

impl ScriptedBackend {
    pub fn failing(steps: &[&str]) -> Self {
        Self {
            failing_steps: steps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Step names executed on `cluster_id`, in order.
    pub fn executed_on(&self, cluster_id: &str) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == cluster_id)
            .map(|(_, step)| step.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterBackend for ScriptedBackend {
    async fn create(&self, spec: &JobSpec) -> Result<ClusterId, BackendError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejected_keys.contains(&spec.source.key) {
            return Err(BackendError::Rejected(format!(
                "invalid input {}",
                spec.source.key
            )));
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("j-test{n}"))
    }

    async fn wait_until_ready(&self, _: &str, _: &JobSpec) -> Result<(), BackendError> {
        Ok(())
    }

    async fn run_step(
        &self,
        cluster_id: &str,
        _: &JobSpec,
        step: &StepSpec,
    ) -> Result<(), BackendError> {
        self.executed
            .lock()
            .unwrap()
            .push((cluster_id.to_string(), step.name.clone()));
        if self.hang_steps {
            std::future::pending::<()>().await;
        }
        if self.failing_steps.contains(&step.name) {
            return Err(BackendError::Step("exit status 1".into()));
        }
        Ok(())
    }

    async fn release(&self, _: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

pub fn step(name: &str, on_failure: FailurePolicy) -> StepSpec {
    StepSpec::new(
        name,
        "spark-submit",
        vec!["s3://{container}/{key}".into(), "{destination}".into()],
        on_failure,
    )
}

pub fn default_steps() -> Vec<StepSpec> {
    vec![
        step("extract", FailurePolicy::Terminate),
        step("transform", FailurePolicy::Terminate),
    ]
}

pub fn notification(key: &str) -> IngestionNotification {
    IngestionNotification::new(
        ObjectRef::new("source-bucket", key),
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
    )
}

fn cluster_manager(
    backend: Arc<dyn ClusterBackend>,
    completions: Arc<InMemoryQueue>,
) -> Arc<ClusterManager> {
    Arc::new(ClusterManager::new(
        backend,
        Arc::new(QueueCompletionPublisher::new(completions)),
        ClusterManagerConfig {
            submission_timeout: Duration::from_secs(1),
            max_run_duration: Duration::from_secs(60),
            publish_retry: fast_retry(3),
            terminal_retention: Duration::from_secs(600),
        },
    ))
}

fn dispatcher_config(instance_id: &str, max_resubmissions: u32) -> DispatcherConfig {
    DispatcherConfig {
        retry: fast_retry(MAX_DISPATCH_ATTEMPTS),
        max_resubmissions,
        instance_id: instance_id.to_string(),
        claim_ttl: CLAIM_TTL,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub registry: Arc<InMemoryJobRegistry>,
    pub ingest: Arc<InMemoryQueue>,
    pub completions: Arc<InMemoryQueue>,
    pub dlq: Arc<InMemoryQueue>,
    pub store: Arc<InMemoryObjectStore>,
    pub bus: Arc<EventBus>,
    pub backend: Arc<ScriptedBackend>,
    pub clusters: Arc<ClusterManager>,
    pub dispatcher: QueueConsumer<Dispatcher>,
    pub completion: QueueConsumer<CompletionHandler>,
    events: broadcast::Receiver<OrchestratorEvent>,
    cluster_backend: Arc<dyn ClusterBackend>,
    template: Arc<JobTemplate>,
    dead_letter: DeadLetterChannel,
    max_resubmissions: u32,
}

impl Harness {
    pub fn new(backend: ScriptedBackend, steps: Vec<StepSpec>) -> Self {
        Self::with_resubmissions(backend, steps, 0)
    }

    pub fn with_resubmissions(
        backend: ScriptedBackend,
        steps: Vec<StepSpec>,
        max_resubmissions: u32,
    ) -> Self {
        let backend = Arc::new(backend);
        Self::build(backend.clone(), backend, steps, max_resubmissions)
    }

    /// Run clusters on `cluster_backend` instead of the scripted one.
    pub fn with_cluster_backend(
        cluster_backend: Arc<dyn ClusterBackend>,
        steps: Vec<StepSpec>,
    ) -> Self {
        Self::build(Arc::new(ScriptedBackend::default()), cluster_backend, steps, 0)
    }

    fn build(
        backend: Arc<ScriptedBackend>,
        cluster_backend: Arc<dyn ClusterBackend>,
        steps: Vec<StepSpec>,
        max_resubmissions: u32,
    ) -> Self {
        let registry = Arc::new(InMemoryJobRegistry::new());
        let ingest = Arc::new(InMemoryQueue::new("ingest"));
        let completions = Arc::new(InMemoryQueue::new("completions"));
        let dlq = Arc::new(InMemoryQueue::new("dead-letter"));
        let store = Arc::new(InMemoryObjectStore::new());
        let bus = Arc::new(EventBus::default());
        let events = bus.subscribe();

        let clusters = cluster_manager(cluster_backend.clone(), completions.clone());

        let template = Arc::new(JobTemplate {
            destination_bucket: DESTINATION_BUCKET.into(),
            output_prefix: OUTPUT_PREFIX.into(),
            topology: InstanceTopology::standard("m5.xlarge", "m5.xlarge", 2, "emr-6.7.0", None),
            steps,
        });
        let dead_letter = DeadLetterChannel::new(dlq.clone(), bus.clone());
        let settings = ReceiveSettings {
            batch_size: 10,
            wait: Duration::ZERO,
        };

        let dispatcher = Dispatcher::new(
            registry.clone(),
            clusters.clone(),
            template.clone(),
            dead_letter.clone(),
            bus.clone(),
            ingest.name(),
            dispatcher_config(INSTANCE_ID, max_resubmissions),
        );
        let completion_handler = CompletionHandler::new(
            registry.clone(),
            store.clone(),
            ingest.clone(),
            bus.clone(),
            DESTINATION_BUCKET,
            OUTPUT_PREFIX,
            CompletionHandlerConfig {
                max_resubmissions,
                unknown_cluster_retry: Duration::from_millis(10),
                max_unknown_receives: MAX_UNKNOWN_RECEIVES,
                retry: fast_retry(5),
            },
        );

        Self {
            dispatcher: QueueConsumer::new(
                "dispatcher",
                ingest.clone(),
                dead_letter.clone(),
                Arc::new(dispatcher),
                settings.clone(),
            ),
            completion: QueueConsumer::new(
                "completion",
                completions.clone(),
                dead_letter.clone(),
                Arc::new(completion_handler),
                settings,
            ),
            cluster_backend,
            template,
            dead_letter,
            max_resubmissions,
            registry,
            ingest,
            completions,
            dlq,
            store,
            bus,
            backend,
            clusters,
            events,
        }
    }

    /// A dispatcher for another worker process: same registry, backend and
    /// queues, but its own cluster manager.
    pub fn peer_dispatcher(&self, instance_id: &str) -> (Arc<Dispatcher>, Arc<ClusterManager>) {
        let clusters = cluster_manager(self.cluster_backend.clone(), self.completions.clone());
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            clusters.clone(),
            self.template.clone(),
            self.dead_letter.clone(),
            self.bus.clone(),
            self.ingest.name(),
            dispatcher_config(instance_id, self.max_resubmissions),
        );
        (Arc::new(dispatcher), clusters)
    }

    pub async fn notify(&self, key: &str) -> IngestionNotification {
        let notification = notification(key);
        self.ingest.send(&notification.to_body().unwrap()).await.unwrap();
        notification
    }

    /// Poll the ingest queue until nothing visible is left.
    pub async fn dispatch_all(&self) {
        while self.dispatcher.poll_once().await.unwrap() > 0 {}
    }

    /// Wait for every cluster the registry knows about to finish.
    pub async fn settle_clusters(&self) {
        for record in self.registry.all().await {
            if let Some(cluster_id) = record.cluster_id {
                self.clusters.wait_for_terminal(&cluster_id).await;
            }
        }
    }

    /// Poll the completion queue until nothing visible is left.
    pub async fn complete_all(&self) {
        while self.completion.poll_once().await.unwrap() > 0 {}
    }

    pub async fn run_to_completion(&self) {
        self.dispatch_all().await;
        self.settle_clusters().await;
        self.complete_all().await;
    }

    pub async fn record(&self, notification: &IngestionNotification) -> JobRecord {
        self.registry
            .get(&notification.fingerprint())
            .await
            .unwrap()
            .expect("job record exists")
    }

    pub fn output_location(&self, job_id: &str) -> ObjectRef {
        JobResult::location(DESTINATION_BUCKET, OUTPUT_PREFIX, job_id)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dlq
            .bodies()
            .await
            .iter()
            .map(|body| serde_json::from_str(body).unwrap())
            .collect()
    }

    /// Events published since the last call.
    pub fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
