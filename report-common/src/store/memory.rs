//! An in-process `ReportStore`, for tests and local development.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::policy::{Role, RoleDirectory};
use crate::report::{Enrichment, EnrichmentResult, PipelineStatus, Report};
use crate::store::{ReportStore, StoreError, StoreResult};

#[derive(Default)]
struct State {
    reports: HashMap<Uuid, Report>,
    enrichment_writes: HashMap<Uuid, usize>,
    roles: HashMap<Uuid, Vec<Role>>,
}

/// A `ReportStore` keeping reports in a map. Every operation runs under a single lock, which
/// makes the conditional update trivially atomic.
#[derive(Clone, Default)]
pub struct MemoryReportStore {
    state: Arc<Mutex<State>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-operation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a report, as a citizen submission would.
    pub fn insert(&self, report: Report) {
        drop(self.lock().reports.insert(report.id, report));
    }

    /// A snapshot of a report, bypassing the `ReportStore` contract.
    pub fn get(&self, id: Uuid) -> Option<Report> {
        self.lock().reports.get(&id).cloned()
    }

    /// How many times enrichment attributes were successfully written for a report.
    pub fn enrichment_writes(&self, id: Uuid) -> usize {
        self.lock().enrichment_writes.get(&id).copied().unwrap_or(0)
    }

    pub fn assign_role(&self, user_id: Uuid, role: Role) {
        let mut state = self.lock();
        let roles = state.roles.entry(user_id).or_default();
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn fetch(&self, id: Uuid) -> StoreResult<Report> {
        self.get(id).ok_or(StoreError::NotFound(id))
    }

    async fn apply_enrichment(
        &self,
        id: Uuid,
        result: &EnrichmentResult,
        expected: PipelineStatus,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let report = state.reports.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if report.pipeline_status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: report.pipeline_status,
            });
        }

        let now = Utc::now();
        report.enrichment = Some(Enrichment {
            result: result.clone(),
            enriched_at: now,
        });
        report.pipeline_status = PipelineStatus::Completed;
        report.pipeline_updated_at = now;

        *state.enrichment_writes.entry(id).or_insert(0) += 1;

        Ok(())
    }

    async fn mark_status(&self, id: Uuid, status: PipelineStatus) -> StoreResult<()> {
        let mut state = self.lock();
        let report = state.reports.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if report.pipeline_status == PipelineStatus::Completed && status != PipelineStatus::Completed
        {
            return Err(StoreError::Conflict {
                id,
                expected: status,
                actual: PipelineStatus::Completed,
            });
        }

        report.pipeline_status = status;
        report.pipeline_updated_at = Utc::now();

        Ok(())
    }

    async fn list_stale(
        &self,
        status: PipelineStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Uuid>> {
        let state = self.lock();
        let mut stale: Vec<&Report> = state
            .reports
            .values()
            .filter(|report| report.pipeline_status == status && report.pipeline_updated_at < before)
            .collect();

        stale.sort_by_key(|report| report.pipeline_updated_at);

        Ok(stale
            .into_iter()
            .take(limit as usize)
            .map(|report| report.id)
            .collect())
    }
}

#[async_trait]
impl RoleDirectory for MemoryReportStore {
    async fn roles_for(&self, user_id: Uuid) -> StoreResult<Vec<Role>> {
        Ok(self.lock().roles.get(&user_id).cloned().unwrap_or_default())
    }
}
