//! Emission of completion events onto the completion stream.

use std::sync::Arc;

use async_trait::async_trait;
use clusterflow_cloud::{MessageQueue, QueueError};
use clusterflow_core::messages::CompletionEvent;
use clusterflow_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Encode(#[from] CoreError),
}

#[async_trait]
pub trait CompletionPublisher: Send + Sync {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError>;
}

/// Publishes `ClusterStateChange` envelopes to a queue.
pub struct QueueCompletionPublisher {
    queue: Arc<dyn MessageQueue>,
}

impl QueueCompletionPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl CompletionPublisher for QueueCompletionPublisher {
    async fn publish(&self, event: &CompletionEvent) -> Result<(), PublishError> {
        let body = event.to_body()?;
        self.queue.send(&body).await?;
        tracing::debug!(
            cluster_id = %event.cluster_id,
            state = %event.terminal_state,
            queue = self.queue.name(),
            "Completion event published"
        );
        Ok(())
    }
}
