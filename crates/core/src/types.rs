use std::fmt;

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Deterministic job identifier, `job-<uuid>`.
pub type JobId = String;

/// Identifier assigned by the compute-cluster service.
pub type ClusterId = String;

/// Location of an object in a store: a container (bucket) plus a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub container: String,
    #[serde(rename = "objectKey")]
    pub key: String,
}

impl ObjectRef {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// `s3://container/key` style URI.
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.container, self.key)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}
