//! S3-backed [`ObjectStore`].

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use clusterflow_core::ObjectRef;

use crate::object_store::{ObjectStore, StoreError};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        location: &ObjectRef,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&location.container)
            .key(&location.key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::request(location, DisplayErrorContext(e).to_string()))?;
        Ok(())
    }

    async fn get(&self, location: &ObjectRef) -> Result<Option<Vec<u8>>, StoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&location.container)
            .key(&location.key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                return match e.into_service_error() {
                    GetObjectError::NoSuchKey(_) => Ok(None),
                    other => Err(StoreError::request(
                        location,
                        DisplayErrorContext(other).to_string(),
                    )),
                };
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::request(location, e.to_string()))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }
}
