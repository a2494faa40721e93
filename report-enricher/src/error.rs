use std::time;

use report_common::classifier::ClassificationError;
use report_common::store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Enumeration of errors that end an enrichment attempt.
#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("report {0} not found")]
    NotFound(Uuid),
    #[error("report {id} cannot be enriched: {reason}")]
    Malformed { id: Uuid, reason: String },
    #[error("classification failed: {0}")]
    Classification(#[from] ClassificationError),
    #[error("store operation failed: {0}")]
    Store(StoreError),
    #[error("enrichment did not finish within {0:?}")]
    DeadlineExceeded(time::Duration),
}

impl From<StoreError> for EnrichmentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => EnrichmentError::NotFound(id),
            StoreError::Malformed { id, reason } => EnrichmentError::Malformed { id, reason },
            error => EnrichmentError::Store(error),
        }
    }
}

/// Errors returned when handing a trigger to the worker queue.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TriggerQueueError {
    #[error("trigger queue is full")]
    Full,
    #[error("trigger queue is closed")]
    Closed,
}

/// Enumeration of errors that stop the enrichment worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker semaphore was closed")]
    SemaphoreClosed,
}
