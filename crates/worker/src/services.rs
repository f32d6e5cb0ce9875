//! Service construction and task spawning.
//!
//! Every component receives explicit `Arc` handles built here; there is no
//! process-wide state.

use std::sync::Arc;

use clusterflow_cloud::{
    InMemoryObjectStore, InMemoryQueue, MessageQueue, ObjectStore, S3ObjectStore, SqsQueue,
};
use clusterflow_cluster::{ClusterManager, ProcessBackend, QueueCompletionPublisher};
use clusterflow_db::{InMemoryJobRegistry, JobRegistry, PgJobRegistry};
use clusterflow_events::{DeadLetterChannel, EventBus, FailureReporter};
use clusterflow_pipeline::{
    CompletionHandler, Dispatcher, QueueConsumer, Reconciler, RetentionSweeper,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;

/// The three queues every role talks to.
pub struct Queues {
    pub ingest: Arc<dyn MessageQueue>,
    pub completion: Arc<dyn MessageQueue>,
    pub dead_letter: Arc<dyn MessageQueue>,
}

/// Shared handles, built once at startup.
pub struct Services {
    pub config: WorkerConfig,
    pub registry: Arc<dyn JobRegistry>,
    pub queues: Queues,
    pub store: Arc<dyn ObjectStore>,
    pub bus: Arc<EventBus>,
    /// Present when this process runs the dispatcher role.
    pub clusters: Option<Arc<ClusterManager>>,
}

impl Services {
    /// Connect to the registry, queues and object store named by `config`.
    pub async fn connect(config: WorkerConfig) -> anyhow::Result<Self> {
        let registry: Arc<dyn JobRegistry> = match &config.database_url {
            Some(url) => {
                let pool = clusterflow_db::create_pool(url).await?;
                tracing::info!("Database connection pool created");
                clusterflow_db::health_check(&pool).await?;
                tracing::info!("Database health check passed");
                clusterflow_db::run_migrations(&pool).await?;
                tracing::info!("Database migrations applied");
                Arc::new(PgJobRegistry::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory job registry");
                Arc::new(InMemoryJobRegistry::new())
            }
        };

        let (queues, store): (Queues, Arc<dyn ObjectStore>) = match &config.queues {
            Some(urls) => {
                let aws = clusterflow_cloud::load_aws_config().await;
                let sqs = aws_sdk_sqs::Client::new(&aws);
                let queues = Queues {
                    ingest: Arc::new(SqsQueue::new(sqs.clone(), urls.ingest.clone())),
                    completion: Arc::new(SqsQueue::new(sqs.clone(), urls.completion.clone())),
                    dead_letter: Arc::new(SqsQueue::new(sqs, urls.dead_letter.clone())),
                };
                let store: Arc<dyn ObjectStore> =
                    Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&aws)));
                tracing::info!(ingest = %urls.ingest, completion = %urls.completion, "Using SQS queues and S3 output store");
                (queues, store)
            }
            None => {
                tracing::warn!("Queue URLs not set, using in-memory queues and object store");
                let visibility = config.visibility_timeout();
                let queue = |name: &str| -> Arc<dyn MessageQueue> {
                    Arc::new(InMemoryQueue::new(name).with_visibility_timeout(visibility))
                };
                let queues = Queues {
                    ingest: queue("ingest"),
                    completion: queue("completion"),
                    dead_letter: queue("dead-letter"),
                };
                let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
                (queues, store)
            }
        };

        let clusters = config.role.runs_dispatcher().then(|| {
            Arc::new(ClusterManager::new(
                Arc::new(ProcessBackend::new(config.cluster_work_dir.clone())),
                Arc::new(QueueCompletionPublisher::new(Arc::clone(&queues.completion))),
                config.cluster_manager_config(),
            ))
        });

        Ok(Self {
            config,
            registry,
            queues,
            store,
            bus: Arc::new(EventBus::default()),
            clusters,
        })
    }

    fn dead_letter_channel(&self) -> DeadLetterChannel {
        DeadLetterChannel::new(Arc::clone(&self.queues.dead_letter), Arc::clone(&self.bus))
    }

    fn completion_handler(&self) -> Arc<CompletionHandler> {
        Arc::new(CompletionHandler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.queues.ingest),
            Arc::clone(&self.bus),
            self.config.destination_bucket.clone(),
            self.config.output_prefix.clone(),
            self.config.completion_config(),
        ))
    }

    /// Spawn every background task for the configured role.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        // Failure reporter subscribes first so no failure is missed.
        let reporter = FailureReporter::new(Arc::clone(&self.queues.dead_letter));
        let receiver = self.bus.subscribe();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            reporter.run(receiver, token).await;
        }));

        if let Some(clusters) = &self.clusters {
            let dispatcher = Dispatcher::new(
                Arc::clone(&self.registry),
                Arc::clone(clusters),
                Arc::new(self.config.template()),
                self.dead_letter_channel(),
                Arc::clone(&self.bus),
                self.queues.ingest.name(),
                self.config.dispatcher_config(),
            );
            let consumer = QueueConsumer::new(
                "dispatcher",
                Arc::clone(&self.queues.ingest),
                self.dead_letter_channel(),
                Arc::new(dispatcher),
                self.config.receive_settings(),
            );
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { consumer.run(token).await }));

            let reconciler = Reconciler::new(
                Arc::clone(&self.registry),
                Arc::clone(clusters),
                self.completion_handler(),
                self.config.reconciler_config(),
            );
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { reconciler.run(token).await }));
        }

        if self.config.role.runs_completion() {
            let consumer = QueueConsumer::new(
                "completion",
                Arc::clone(&self.queues.completion),
                self.dead_letter_channel(),
                self.completion_handler(),
                self.config.receive_settings(),
            );
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { consumer.run(token).await }));

            let sweeper =
                RetentionSweeper::new(Arc::clone(&self.registry), self.config.retention_days);
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { sweeper.run(token).await }));
        }

        tracing::info!(
            role = ?self.config.role,
            instance_id = %self.config.instance_id,
            tasks = tasks.len(),
            "Worker services started"
        );
        tasks
    }

    /// Stop in-flight clusters. Called after the consumers have stopped.
    pub async fn shutdown(&self) {
        if let Some(clusters) = &self.clusters {
            clusters.shutdown().await;
        }
    }
}
