#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A payload received from a queue or event stream did not match its schema.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
