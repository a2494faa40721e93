//! # Store
//!
//! Access to persisted reports, restricted to what the enrichment pipeline reads and writes.
//!
//! The one hard requirement on an implementation is that `apply_enrichment` is an atomic
//! compare-and-set on the pipeline status: of all writers expecting the same prior status, at most
//! one can succeed.
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::report::{EnrichmentResult, PipelineStatus, Report};

pub mod memory;
pub mod postgres;

/// Enumeration of errors returned by a `ReportStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("report {0} not found")]
    NotFound(Uuid),
    #[error("report {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: PipelineStatus,
        actual: PipelineStatus,
    },
    #[error("report {id} is malformed: {reason}")]
    Malformed { id: Uuid, reason: String },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("store operation timed out after {0:?}")]
    Timeout(time::Duration),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Read and write access to reports.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Fetch a report by id. Fails with `StoreError::NotFound` if absent.
    async fn fetch(&self, id: Uuid) -> StoreResult<Report>;

    /// Write all enrichment attributes and move the report to `Completed`, but only if its pipeline
    /// status still equals `expected` at write time. Fails with `StoreError::Conflict` otherwise.
    async fn apply_enrichment(
        &self,
        id: Uuid,
        result: &EnrichmentResult,
        expected: PipelineStatus,
    ) -> StoreResult<()>;

    /// Set the pipeline status regardless of its current value, except that a `Completed` report
    /// is never moved away from `Completed`: that case fails with `StoreError::Conflict`.
    async fn mark_status(&self, id: Uuid, status: PipelineStatus) -> StoreResult<()>;

    /// Ids of reports that have been in `status` since before `before`, oldest first.
    async fn list_stale(
        &self,
        status: PipelineStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Uuid>>;
}

/// Run a store operation with a deadline, mapping elapsed deadlines to `StoreError::Timeout`.
pub async fn with_timeout<T, F>(timeout: time::Duration, operation: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}
