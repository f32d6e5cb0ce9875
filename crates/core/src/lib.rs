//! Domain types shared by every clusterflow crate: job records and their
//! state machine, fingerprints, job specs, wire messages and retry policy.

pub mod cluster;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod job_spec;
pub mod messages;
pub mod retry;
pub mod storage_keys;
pub mod types;

pub use error::CoreError;
pub use fingerprint::Fingerprint;
pub use job::{FailureKind, JobRecord, JobState, NewJobRecord, TransitionFields};
pub use types::{ClusterId, JobId, ObjectRef, Timestamp};
