//! Queue receive loop shared by the Dispatcher and the Completion Handler.
//!
//! Deleting a message is the commit point. A handler never deletes messages
//! itself; it returns a [`Disposition`] and the consumer applies it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clusterflow_cloud::{MessageQueue, QueueError, QueueMessage};
use clusterflow_events::DeadLetterChannel;
use tokio_util::sync::CancellationToken;

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What to do with a message once its handler is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Work accepted or already done: delete the message.
    Commit,
    /// Leave the message on the queue, visible again after `delay`.
    Retry { delay: Duration },
    /// Move the message to the dead-letter queue, then delete it.
    DeadLetter { reason: String },
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Disposition;
}

#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    /// Messages per receive call.
    pub batch_size: u32,
    /// Long-poll duration.
    pub wait: Duration,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(20),
        }
    }
}

pub struct QueueConsumer<H> {
    name: &'static str,
    queue: Arc<dyn MessageQueue>,
    dead_letter: DeadLetterChannel,
    handler: Arc<H>,
    settings: ReceiveSettings,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(
        name: &'static str,
        queue: Arc<dyn MessageQueue>,
        dead_letter: DeadLetterChannel,
        handler: Arc<H>,
        settings: ReceiveSettings,
    ) -> Self {
        Self {
            name,
            queue,
            dead_letter,
            handler,
            settings,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Run the receive loop until the cancellation token is triggered.
    ///
    /// A message already received when cancellation arrives is finished
    /// before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            consumer = self.name,
            queue = self.queue.name(),
            batch_size = self.settings.batch_size,
            "Consumer started"
        );
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(self.settings.batch_size, self.settings.wait) => received,
            };
            match received {
                Ok(messages) => self.process(&messages).await,
                Err(e) => {
                    tracing::warn!(consumer = self.name, error = %e, "Receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::info!(consumer = self.name, "Consumer shutting down");
    }

    /// Receive one batch and settle every message in it. Returns the number
    /// of messages received.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let messages = self
            .queue
            .receive(self.settings.batch_size, self.settings.wait)
            .await?;
        self.process(&messages).await;
        Ok(messages.len())
    }

    async fn process(&self, messages: &[QueueMessage]) {
        for message in messages {
            let disposition = self.handler.handle(message).await;
            self.settle(message, disposition).await;
        }
    }

    async fn settle(&self, message: &QueueMessage, disposition: Disposition) {
        match disposition {
            Disposition::Commit => self.delete(message).await,
            Disposition::Retry { delay } => {
                if let Err(e) = self.queue.change_visibility(&message.receipt, delay).await {
                    tracing::warn!(
                        consumer = self.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to delay message, default visibility timeout applies"
                    );
                }
            }
            Disposition::DeadLetter { reason } => {
                match self
                    .dead_letter
                    .send(self.queue.name(), message, &reason)
                    .await
                {
                    Ok(()) => self.delete(message).await,
                    Err(e) => tracing::error!(
                        consumer = self.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Failed to dead-letter message, leaving it on the queue"
                    ),
                }
            }
        }
    }

    async fn delete(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(&message.receipt).await {
            tracing::warn!(
                consumer = self.name,
                message_id = %message.message_id,
                error = %e,
                "Failed to delete message, it will be redelivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use clusterflow_cloud::InMemoryQueue;
    use clusterflow_events::{DeadLetterRecord, EventBus};

    use super::*;

    /// Dispositions keyed by message body.
    struct ByBody;

    #[async_trait]
    impl MessageHandler for ByBody {
        async fn handle(&self, message: &QueueMessage) -> Disposition {
            match message.body.as_str() {
                "ok" => Disposition::Commit,
                "later" => Disposition::Retry {
                    delay: Duration::from_secs(60),
                },
                _ => Disposition::DeadLetter {
                    reason: "unreadable".into(),
                },
            }
        }
    }

    #[tokio::test]
    async fn applies_each_disposition() {
        let queue = Arc::new(InMemoryQueue::new("ingest"));
        let dlq = Arc::new(InMemoryQueue::new("dlq"));
        let channel = DeadLetterChannel::new(dlq.clone(), Arc::new(EventBus::default()));
        let consumer = QueueConsumer::new(
            "test",
            queue.clone(),
            channel,
            Arc::new(ByBody),
            ReceiveSettings {
                batch_size: 10,
                wait: Duration::ZERO,
            },
        );

        for body in ["ok", "later", "???"] {
            queue.send(body).await.unwrap();
        }
        assert_eq!(consumer.poll_once().await.unwrap(), 3);

        // Only the retried message is left, hidden for now.
        assert_eq!(queue.bodies().await, ["later"]);
        assert_eq!(consumer.poll_once().await.unwrap(), 0);

        let dead = dlq.bodies().await;
        assert_eq!(dead.len(), 1);
        let record: DeadLetterRecord = serde_json::from_str(&dead[0]).unwrap();
        assert_eq!(record.body, "???");
        assert_eq!(record.source_queue, "ingest");
    }
}
