//! Infrastructure seams: message queues and the destination object store.
//!
//! Every component receives these as `Arc<dyn ...>` handles built once at
//! startup. The AWS implementations talk to SQS and S3; the in-memory ones
//! back tests and local runs.

pub mod memory_queue;
pub mod memory_store;
pub mod object_store;
pub mod queue;
pub mod s3;
pub mod sqs;

pub use memory_queue::InMemoryQueue;
pub use memory_store::InMemoryObjectStore;
pub use object_store::{ObjectStore, StoreError};
pub use queue::{MessageQueue, QueueError, QueueMessage};
pub use s3::S3ObjectStore;
pub use sqs::SqsQueue;

/// Load the shared AWS configuration from the environment.
pub async fn load_aws_config() -> aws_config::SdkConfig {
    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await
}
