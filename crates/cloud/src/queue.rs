use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue request failed on {queue}: {message}")]
    Request { queue: String, message: String },

    #[error("Queue returned an incomplete message: {0}")]
    IncompleteMessage(String),
}

/// A received message. It stays invisible to other consumers until it is
/// deleted or its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    /// Handle for `delete` / `change_visibility` on this receipt.
    pub receipt: String,
    pub body: String,
    /// How many times the message has been received, including this time.
    pub receive_count: u32,
}

/// Durable at-least-once queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Receive up to `max_messages`, long-polling for at most `wait`.
    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Remove a message. This is the commit point for consumers.
    async fn delete(&self, receipt: &str) -> Result<(), QueueError>;

    /// Hide a received message for `timeout` before it is redelivered.
    async fn change_visibility(&self, receipt: &str, timeout: Duration)
        -> Result<(), QueueError>;

    async fn send(&self, body: &str) -> Result<(), QueueError>;
}
