//! In-process [`ObjectStore`] that also counts writes per key.

use std::collections::HashMap;

use async_trait::async_trait;
use clusterflow_core::ObjectRef;
use tokio::sync::RwLock;

use crate::object_store::{ObjectStore, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    writes: u32,
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectRef, StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `location` has been written.
    pub async fn write_count(&self, location: &ObjectRef) -> u32 {
        self.objects
            .read()
            .await
            .get(location)
            .map_or(0, |o| o.writes)
    }

    pub async fn content_type(&self, location: &ObjectRef) -> Option<String> {
        self.objects
            .read()
            .await
            .get(location)
            .map(|o| o.content_type.clone())
    }

    pub async fn keys(&self) -> Vec<ObjectRef> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        location: &ObjectRef,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let writes = objects.get(location).map_or(0, |o| o.writes) + 1;
        objects.insert(
            location.clone(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                writes,
            },
        );
        Ok(())
    }

    async fn get(&self, location: &ObjectRef) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .objects
            .read()
            .await
            .get(location)
            .map(|o| o.body.clone()))
    }
}
