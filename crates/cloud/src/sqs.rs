//! SQS-backed [`MessageQueue`].

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;

use crate::queue::{MessageQueue, QueueError, QueueMessage};

/// SQS caps a single receive at ten messages and a long poll at 20 seconds.
const MAX_RECEIVE_BATCH: u32 = 10;
const MAX_WAIT_SECS: u64 = 20;

#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    name: String,
}

impl SqsQueue {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        let queue_url = queue_url.into();
        let name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or(queue_url.as_str())
            .to_string();
        Self {
            client,
            queue_url,
            name,
        }
    }

    fn request_error(&self, error: impl std::error::Error) -> QueueError {
        QueueError::Request {
            queue: self.name.clone(),
            message: DisplayErrorContext(error).to_string(),
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        output
            .messages()
            .iter()
            .map(|message| {
                let message_id = message.message_id().unwrap_or_default().to_string();
                let receipt = message
                    .receipt_handle()
                    .ok_or_else(|| {
                        QueueError::IncompleteMessage(format!(
                            "message {message_id} has no receipt handle"
                        ))
                    })?
                    .to_string();
                let receive_count = message
                    .attributes()
                    .and_then(|attrs| {
                        attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount)
                    })
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);
                Ok(QueueMessage {
                    message_id,
                    receipt,
                    body: message.body().unwrap_or_default().to_string(),
                    receive_count,
                })
            })
            .collect()
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(())
    }

    async fn change_visibility(
        &self,
        receipt: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(timeout.as_secs().min(i32::MAX as u64) as i32)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(())
    }
}
