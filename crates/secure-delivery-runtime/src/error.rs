use thiserror::Error;

/// Failures surfaced by jobs and the job manager.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Delivery error: {0}")]
    Delivery(#[from] secure_delivery::Error),

    #[error("Retry later: {reason}")]
    RetryLater {
        reason: String,
        backoff_ms: Option<u64>,
    },

    #[error("Not registered for push")]
    NotRegistered,

    #[error("Proof required (retry after {retry_after_ms:?} ms)")]
    ProofRequired { retry_after_ms: Option<u64> },

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Network failure for {0} recipients")]
    NetworkFailure(usize),

    #[error("Identity mismatch for {0} recipients")]
    IdentityMismatch(usize),

    #[error("Message {0} was not delivered to any recipient")]
    Undeliverable(String),

    #[error("Job canceled")]
    Canceled,

    #[error("Queue {queue_key} is full")]
    QueueFull { queue_key: String },

    #[error("No job factory registered for {0}")]
    UnknownFactory(String),

    #[error("Job manager is shut down")]
    Shutdown,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    pub fn retry_later(reason: impl Into<String>) -> Self {
        JobError::RetryLater {
            reason: reason.into(),
            backoff_ms: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
