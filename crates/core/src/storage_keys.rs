//! Destination key layout. Output for a job always lands under the same key,
//! so repeated finalization overwrites instead of duplicating.

pub const DEFAULT_OUTPUT_PREFIX: &str = "results";

fn job_dir(prefix: &str, job_id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        job_id.to_string()
    } else {
        format!("{prefix}/{job_id}")
    }
}

/// `<prefix>/<job_id>/output`
pub fn output_object_key(prefix: &str, job_id: &str) -> String {
    format!("{}/output", job_dir(prefix, job_id))
}

/// `s3://<bucket>/<prefix>/<job_id>/`, handed to steps as their output root.
pub fn destination_uri(bucket: &str, prefix: &str, job_id: &str) -> String {
    format!("s3://{bucket}/{}/", job_dir(prefix, job_id))
}
