use thiserror::Error;

use job_common::cache::CacheError;
use job_common::storage::StorageError;
use job_common::store::StoreError;

/// Errors a handler attempt can produce. The classification drives the
/// worker's retry loop: only retryable errors re-enter it.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("unknown job type {0}")]
    UnknownJobType(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::Panicked(_))
    }
}

/// Errors related to initialization and consumption of jobs. Failing to
/// advance durable state surfaces here so the offset stays unstored and the
/// message is redelivered.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when executing a job: {0}")]
    StoreError(#[from] StoreError),
    #[error("a cache error occurred when executing a job: {0}")]
    CacheError(#[from] CacheError),
    #[error("a kafka error occurred: {0}")]
    KafkaError(#[from] rdkafka::error::KafkaError),
    #[error("failed to open the staging directory: {0}")]
    StorageError(#[from] StorageError),
    #[error("shutdown interrupted the retry loop")]
    Interrupted,
}
