//! Durable dead-lettering of messages a consumer cannot process.

use std::sync::Arc;

use chrono::Utc;
use clusterflow_cloud::{MessageQueue, QueueError, QueueMessage};
use clusterflow_core::Timestamp;
use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, OrchestratorEvent};

/// Discriminator carried by every payload on the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// A [`DeadLetterRecord`]: a message no consumer could process.
    MessageDeadLettered,
    /// A [`FailureNotice`](crate::reporter::FailureNotice).
    JobFailed,
}

#[derive(Deserialize)]
struct KindOnly {
    kind: DeadLetterKind,
}

impl DeadLetterKind {
    /// Read the discriminator of a dead-letter queue body without decoding
    /// the rest.
    pub fn of(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<KindOnly>(body).map(|k| k.kind)
    }
}

/// What lands on the dead-letter queue for a rejected message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub kind: DeadLetterKind,
    pub source_queue: String,
    pub message_id: String,
    pub receive_count: u32,
    pub reason: String,
    /// The original message body, unchanged.
    pub body: String,
    pub dead_lettered_at: Timestamp,
}

#[derive(Clone)]
pub struct DeadLetterChannel {
    queue: Arc<dyn MessageQueue>,
    bus: Arc<EventBus>,
}

impl DeadLetterChannel {
    pub fn new(queue: Arc<dyn MessageQueue>, bus: Arc<EventBus>) -> Self {
        Self { queue, bus }
    }

    /// Write `message` to the dead-letter queue.
    ///
    /// The caller deletes the source message only after this returns `Ok`.
    pub async fn send(
        &self,
        source_queue: &str,
        message: &QueueMessage,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.send_body(source_queue, message, reason, &message.body)
            .await
    }

    /// Like [`send`](Self::send) but with an explicit body, for rejecting one
    /// entry of a batched message.
    pub async fn send_body(
        &self,
        source_queue: &str,
        message: &QueueMessage,
        reason: &str,
        body: &str,
    ) -> Result<(), QueueError> {
        let record = DeadLetterRecord {
            kind: DeadLetterKind::MessageDeadLettered,
            source_queue: source_queue.to_string(),
            message_id: message.message_id.clone(),
            receive_count: message.receive_count,
            reason: reason.to_string(),
            body: body.to_string(),
            dead_lettered_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&record).map_err(|e| QueueError::Request {
            queue: self.queue.name().to_string(),
            message: format!("failed to encode dead-letter record: {e}"),
        })?;
        self.queue.send(&encoded).await?;

        self.bus.publish(OrchestratorEvent::MessageDeadLettered {
            queue: source_queue.to_string(),
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
            timestamp: record.dead_lettered_at,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clusterflow_cloud::InMemoryQueue;

    use super::*;

    #[tokio::test]
    async fn preserves_original_body_and_notifies_bus() {
        let dlq = Arc::new(InMemoryQueue::new("dlq"));
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let channel = DeadLetterChannel::new(dlq.clone(), bus);

        let message = QueueMessage {
            message_id: "m-1".into(),
            receipt: "r-1".into(),
            body: "not json".into(),
            receive_count: 1,
        };
        channel.send("ingest", &message, "malformed").await.unwrap();

        let bodies = dlq.bodies().await;
        let record: DeadLetterRecord = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(record.kind, DeadLetterKind::MessageDeadLettered);
        assert_eq!(DeadLetterKind::of(&bodies[0]).unwrap(), record.kind);
        assert_eq!(record.body, "not json");
        assert_eq!(record.source_queue, "ingest");
        assert_eq!(record.reason, "malformed");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "message.dead_lettered");
    }
}
