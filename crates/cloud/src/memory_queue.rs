//! In-process [`MessageQueue`] with SQS-like visibility semantics.
//!
//! A received message is hidden until it is deleted or its visibility
//! timeout lapses, and every receipt bumps its receive count. Each receive
//! issues a fresh receipt, so a stale receipt cannot delete a message that
//! was redelivered to someone else.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::queue::{MessageQueue, QueueError, QueueMessage};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

pub struct InMemoryQueue {
    name: String,
    visibility_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
    arrivals: Notify,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            entries: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Messages not yet deleted, visible or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Bodies of all messages not yet deleted, in arrival order.
    pub async fn bodies(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }

    /// Make every hidden message visible again, as if its timeout lapsed.
    pub async fn expire_visibility(&self) {
        let now = Instant::now();
        for entry in self.entries.lock().await.iter_mut() {
            entry.visible_at = now;
        }
        self.arrivals.notify_waiters();
    }

    async fn take_visible(&self, max_messages: u32) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries
            .iter_mut()
            .filter(|e| e.visible_at <= now)
            .take(max_messages.max(1) as usize)
            .map(|entry| {
                let receipt = Uuid::now_v7().to_string();
                entry.receive_count += 1;
                entry.visible_at = now + self.visibility_timeout;
                entry.receipt = Some(receipt.clone());
                QueueMessage {
                    message_id: entry.message_id.clone(),
                    receipt,
                    body: entry.body.clone(),
                    receive_count: entry.receive_count,
                }
            })
            .collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.take_visible(max_messages).await;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            let nap = POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = self.arrivals.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.receipt.as_deref() != Some(receipt));
        if entries.len() == before {
            tracing::debug!(queue = %self.name, "Delete with unknown or stale receipt ignored");
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt.as_deref() == Some(receipt))
            .ok_or_else(|| QueueError::Request {
                queue: self.name.clone(),
                message: "receipt handle is not valid".into(),
            })?;
        entry.visible_at = Instant::now() + timeout;
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<(), QueueError> {
        self.entries.lock().await.push(Entry {
            message_id: Uuid::now_v7().to_string(),
            body: body.to_string(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        self.arrivals.notify_waiters();
        Ok(())
    }
}
