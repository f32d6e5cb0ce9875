use async_trait::async_trait;
use clusterflow_core::ObjectRef;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Object store request failed for {location}: {message}")]
    Request { location: String, message: String },
}

impl StoreError {
    pub fn request(location: &ObjectRef, message: impl Into<String>) -> Self {
        Self::Request {
            location: location.to_string(),
            message: message.into(),
        }
    }
}

/// Destination store. Writes to an existing key overwrite it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        location: &ObjectRef,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// `None` when the object does not exist.
    async fn get(&self, location: &ObjectRef) -> Result<Option<Vec<u8>>, StoreError>;
}
