//! Periodic pass over reports the pipeline lost track of.
//!
//! A report left in `pending` past the pending window is redelivered, since its trigger may have
//! been dropped. A report left in `processing` past the processing deadline is marked `failed`, so
//! that no report stays in `processing` indefinitely.
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use report_common::health::HealthHandle;
use report_common::report::PipelineStatus;
use report_common::store::{with_timeout, ReportStore, StoreError};
use tracing::{error, info, warn};

use crate::error::TriggerQueueError;
use crate::trigger::{Trigger, TriggerSender};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub redelivered: usize,
    pub failed: usize,
}

pub struct Sweeper {
    store: Arc<dyn ReportStore>,
    triggers: TriggerSender,
    store_timeout: time::Duration,
    pending_window: time::Duration,
    processing_deadline: time::Duration,
    batch_size: u32,
}

/// The instant `window` before `now`, saturating at the earliest representable time.
fn cutoff(now: DateTime<Utc>, window: time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn ReportStore>,
        triggers: TriggerSender,
        store_timeout: time::Duration,
        pending_window: time::Duration,
        processing_deadline: time::Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            triggers,
            store_timeout,
            pending_window,
            processing_deadline,
            batch_size,
        }
    }

    pub async fn sweep(&self) -> Result<SweepSummary, StoreError> {
        let now = Utc::now();
        let mut summary = SweepSummary::default();

        let pending = with_timeout(
            self.store_timeout,
            self.store.list_stale(
                PipelineStatus::Pending,
                cutoff(now, self.pending_window),
                self.batch_size,
            ),
        )
        .await?;

        for id in pending {
            match self.triggers.submit(Trigger::delivery(id)) {
                Ok(()) => summary.redelivered += 1,
                Err(TriggerQueueError::Full) => {
                    warn!("trigger queue is full, resuming redelivery on the next sweep");
                    break;
                }
                Err(TriggerQueueError::Closed) => {
                    error!("trigger queue is closed, cannot redeliver stale reports");
                    break;
                }
            }
        }

        let processing = with_timeout(
            self.store_timeout,
            self.store.list_stale(
                PipelineStatus::Processing,
                cutoff(now, self.processing_deadline),
                self.batch_size,
            ),
        )
        .await?;

        for id in processing {
            match with_timeout(
                self.store_timeout,
                self.store.mark_status(id, PipelineStatus::Failed),
            )
            .await
            {
                Ok(()) => {
                    warn!(report_id = %id, "report exceeded the processing deadline, marked as failed");
                    summary.failed += 1;
                }
                // Completed or deleted since it was listed.
                Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {}
                Err(error) => {
                    warn!(report_id = %id, "failed to mark stale report as failed: {}", error);
                }
            }
        }

        metrics::counter!("report_enrichment_sweeper_redelivered_total")
            .increment(summary.redelivered as u64);
        metrics::counter!("report_enrichment_sweeper_failed_total")
            .increment(summary.failed as u64);

        Ok(summary)
    }
}

/// Sweep every `interval`, reporting liveness after each pass.
pub async fn sweep_loop(sweeper: Sweeper, interval: time::Duration, liveness: HealthHandle) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        match sweeper.sweep().await {
            Ok(summary) if summary != SweepSummary::default() => info!(
                redelivered = summary.redelivered,
                failed = summary.failed,
                "swept stale reports"
            ),
            Ok(_) => {}
            Err(error) => error!("sweep failed: {}", error),
        }

        liveness.report_healthy();
    }
}

#[cfg(test)]
mod tests {
    use report_common::report::Report;
    use report_common::store::memory::MemoryReportStore;

    use super::*;
    use crate::trigger::{trigger_channel, TriggerSource};

    fn report_in(status: PipelineStatus, age: chrono::Duration) -> Report {
        let mut report = Report::new(18.53, 73.85, "https://example.com/before.jpg");
        report.pipeline_status = status;
        report.pipeline_updated_at = Utc::now() - age;
        report
    }

    fn sweeper(store: &MemoryReportStore, triggers: TriggerSender) -> Sweeper {
        Sweeper::new(
            Arc::new(store.clone()),
            triggers,
            time::Duration::from_secs(1),
            time::Duration::from_secs(300),
            time::Duration::from_secs(600),
            100,
        )
    }

    #[tokio::test]
    async fn test_sweep_redelivers_stale_pending() {
        let store = MemoryReportStore::new();
        let stale = report_in(PipelineStatus::Pending, chrono::Duration::minutes(10));
        let fresh = report_in(PipelineStatus::Pending, chrono::Duration::seconds(5));
        store.insert(stale.clone());
        store.insert(fresh);
        let (sender, mut source) = trigger_channel(8);

        let summary = sweeper(&store, sender).sweep().await.unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                redelivered: 1,
                failed: 0
            }
        );
        assert_eq!(source.next_trigger().await, Some(Trigger::delivery(stale.id)));
    }

    #[tokio::test]
    async fn test_sweep_fails_stuck_processing() {
        let store = MemoryReportStore::new();
        let stuck = report_in(PipelineStatus::Processing, chrono::Duration::minutes(20));
        let running = report_in(PipelineStatus::Processing, chrono::Duration::minutes(1));
        let done = report_in(PipelineStatus::Completed, chrono::Duration::hours(2));
        store.insert(stuck.clone());
        store.insert(running.clone());
        store.insert(done.clone());
        let (sender, _source) = trigger_channel(8);

        let summary = sweeper(&store, sender).sweep().await.unwrap();

        assert_eq!(
            summary,
            SweepSummary {
                redelivered: 0,
                failed: 1
            }
        );
        assert_eq!(
            store.get(stuck.id).unwrap().pipeline_status,
            PipelineStatus::Failed
        );
        assert_eq!(
            store.get(running.id).unwrap().pipeline_status,
            PipelineStatus::Processing
        );
        assert_eq!(
            store.get(done.id).unwrap().pipeline_status,
            PipelineStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_sweep_stops_redelivering_when_queue_is_full() {
        let store = MemoryReportStore::new();
        for minutes in [10, 20, 30] {
            store.insert(report_in(
                PipelineStatus::Pending,
                chrono::Duration::minutes(minutes),
            ));
        }
        let (sender, _source) = trigger_channel(2);

        let summary = sweeper(&store, sender).sweep().await.unwrap();

        assert_eq!(summary.redelivered, 2);
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc::now();

        assert_eq!(
            cutoff(now, time::Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(
            cutoff(now, time::Duration::MAX),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
