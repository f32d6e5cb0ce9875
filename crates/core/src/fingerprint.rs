//! Input identity used for deduplication.
//!
//! A [`Fingerprint`] names "this object, at this content version". Two
//! notifications for the same object version always produce the same
//! fingerprint, no matter how often or in which order they are delivered.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::ObjectRef;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Deterministic identity of an input object version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for `source` at `content_version`.
    ///
    /// Fields are newline-separated so that `("a/b", "c")` and `("a", "b/c")`
    /// cannot collide.
    pub fn compute(source: &ObjectRef, content_version: &str) -> Self {
        let material = format!("{}\n{}\n{}", source.container, source.key, content_version);
        Self(sha256_hex(material.as_bytes()))
    }

    /// Wrap a fingerprint previously computed and persisted.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
