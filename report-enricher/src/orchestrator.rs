//! # Orchestrator
//!
//! Drives a single report through the enrichment state machine:
//!
//! ```text
//! pending ──► processing ──► completed
//!                  │
//!                  └──────► failed ──(reenrich)──► processing
//! ```
//!
//! Invocations for the same report may run concurrently. No lock is held across the
//! classification call: the conditional write of `ReportStore::apply_enrichment`, expecting
//! `processing`, is the only serialization point. Whichever invocation loses that write reports
//! success without touching the report.
use std::sync::Arc;
use std::time;

use report_common::classifier::{ClassificationError, Classifier};
use report_common::report::{
    Classification, EnrichmentResult, ImagePayload, PipelineStatus, Report,
};
use report_common::retry::RetryPolicy;
use report_common::rules::RuleSet;
use report_common::store::{with_timeout, ReportStore, StoreError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EnrichmentError;
use crate::trigger::{Trigger, TriggerMode};

/// How a trigger was resolved. Every invocation ends in exactly one of these.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// This invocation wrote the enrichment attributes.
    Completed(EnrichmentResult),
    /// The report was already completed: nothing to do.
    AlreadyCompleted,
    /// The report failed earlier and the trigger is not an explicit re-enrichment.
    AlreadyFailed,
    /// A concurrent invocation completed the report first.
    LostRace,
    /// The report moved to another status, usually `failed` by the sweeper, while this
    /// invocation was running. The late write was rejected.
    Superseded(PipelineStatus),
    /// The attempt failed. `status_marked` tells whether the report was moved to `failed`.
    Failed {
        error: EnrichmentError,
        status_marked: bool,
    },
}

/// The three ways an invocation can end, as seen by whoever delivered the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    FailedWithStatusUpdate,
    FailedWithoutStatusUpdate,
}

impl TriggerOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            TriggerOutcome::Failed {
                status_marked: true,
                ..
            } => Disposition::FailedWithStatusUpdate,
            TriggerOutcome::Failed {
                status_marked: false,
                ..
            } => Disposition::FailedWithoutStatusUpdate,
            _ => Disposition::Success,
        }
    }

    pub fn is_success(&self) -> bool {
        self.disposition() == Disposition::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOutcome::Completed(_) => "completed",
            TriggerOutcome::AlreadyCompleted => "already_completed",
            TriggerOutcome::AlreadyFailed => "already_failed",
            TriggerOutcome::LostRace => "lost_race",
            TriggerOutcome::Superseded(_) => "superseded",
            TriggerOutcome::Failed { .. } => "failed",
        }
    }

    /// The pipeline status the report is known to be in after this invocation, if known.
    pub fn pipeline_status(&self) -> Option<PipelineStatus> {
        match self {
            TriggerOutcome::Completed(_)
            | TriggerOutcome::AlreadyCompleted
            | TriggerOutcome::LostRace => Some(PipelineStatus::Completed),
            TriggerOutcome::AlreadyFailed => Some(PipelineStatus::Failed),
            TriggerOutcome::Superseded(status) => Some(*status),
            TriggerOutcome::Failed {
                status_marked: true,
                ..
            } => Some(PipelineStatus::Failed),
            TriggerOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&EnrichmentError> {
        match self {
            TriggerOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Result of trying to move a report to `failed`.
enum FailureMark {
    Marked,
    /// The report completed in the meantime, and completed is never overwritten.
    AlreadyCompleted,
    NotMarked,
}

pub struct Orchestrator {
    store: Arc<dyn ReportStore>,
    classifier: Arc<dyn Classifier>,
    rules: RuleSet,
    /// Upper bound for every single store operation.
    store_timeout: time::Duration,
    /// Upper bound for a classification call.
    classify_timeout: time::Duration,
    /// Upper bound for a whole invocation, excluding the failure-marking write.
    invocation_deadline: time::Duration,
    failure_retry: RetryPolicy,
    failure_mark_attempts: u32,
    /// Ignore the classification submitted with a report and always call the classifier.
    reclassify_submissions: bool,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ReportStore>, classifier: Arc<dyn Classifier>) -> Self {
        Self {
            store,
            classifier,
            rules: RuleSet::default(),
            store_timeout: time::Duration::from_secs(2),
            classify_timeout: time::Duration::from_secs(30),
            invocation_deadline: time::Duration::from_secs(60),
            failure_retry: RetryPolicy::default(),
            failure_mark_attempts: 3,
            reclassify_submissions: false,
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_timeouts(
        mut self,
        store_timeout: time::Duration,
        classify_timeout: time::Duration,
        invocation_deadline: time::Duration,
    ) -> Self {
        self.store_timeout = store_timeout;
        self.classify_timeout = classify_timeout;
        self.invocation_deadline = invocation_deadline;
        self
    }

    pub fn with_failure_retry(mut self, retry_policy: RetryPolicy, attempts: u32) -> Self {
        self.failure_retry = retry_policy;
        self.failure_mark_attempts = attempts.max(1);
        self
    }

    pub fn reclassify_submissions(mut self, reclassify: bool) -> Self {
        self.reclassify_submissions = reclassify;
        self
    }

    /// Handle one trigger. Never panics and never returns an error: every failure is folded into
    /// the returned `TriggerOutcome`.
    pub async fn handle(&self, trigger: Trigger) -> TriggerOutcome {
        let report_id = trigger.report_id;
        let start = tokio::time::Instant::now();

        metrics::counter!(
            "report_enrichment_triggers_total",
            &[("mode", trigger.mode.as_str())]
        )
        .increment(1);

        let outcome = match tokio::time::timeout(self.invocation_deadline, self.run(&trigger)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => self.fail(report_id, error).await,
            Err(_) => {
                self.fail(
                    report_id,
                    EnrichmentError::DeadlineExceeded(self.invocation_deadline),
                )
                .await
            }
        };

        metrics::counter!(
            "report_enrichment_outcomes_total",
            &[("outcome", outcome.as_str())]
        )
        .increment(1);
        metrics::histogram!("report_enrichment_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        match &outcome {
            TriggerOutcome::Failed {
                error,
                status_marked,
            } => warn!(
                report_id = %report_id,
                status_marked,
                "enrichment failed: {}",
                error
            ),
            outcome => info!(
                report_id = %report_id,
                outcome = outcome.as_str(),
                "enrichment trigger handled"
            ),
        }

        outcome
    }

    async fn run(&self, trigger: &Trigger) -> Result<TriggerOutcome, EnrichmentError> {
        let id = trigger.report_id;
        let report = with_timeout(self.store_timeout, self.store.fetch(id)).await?;

        match (report.pipeline_status, trigger.mode) {
            (PipelineStatus::Completed, _) => return Ok(TriggerOutcome::AlreadyCompleted),
            (PipelineStatus::Failed, TriggerMode::Delivery) => {
                return Ok(TriggerOutcome::AlreadyFailed)
            }
            _ => {}
        }

        match with_timeout(
            self.store_timeout,
            self.store.mark_status(id, PipelineStatus::Processing),
        )
        .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict {
                actual: PipelineStatus::Completed,
                ..
            }) => return Ok(TriggerOutcome::AlreadyCompleted),
            Err(error) => return Err(error.into()),
        }

        let classification = self.classification_for(trigger, &report).await?;
        let result = self.rules.evaluate(
            classification.category,
            classification.confidence,
            report.latitude,
        );

        debug!(
            report_id = %id,
            category = %classification.category,
            severity = result.severity,
            "applying enrichment"
        );

        match with_timeout(
            self.store_timeout,
            self.store
                .apply_enrichment(id, &result, PipelineStatus::Processing),
        )
        .await
        {
            Ok(()) => Ok(TriggerOutcome::Completed(result)),
            Err(StoreError::Conflict {
                actual: PipelineStatus::Completed,
                ..
            }) => Ok(TriggerOutcome::LostRace),
            Err(StoreError::Conflict { actual, .. }) => {
                warn!(
                    report_id = %id,
                    status = %actual,
                    "report changed status while enriching, discarding result"
                );
                Ok(TriggerOutcome::Superseded(actual))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Pick the classification to enrich with: the one carried by the trigger, then the one
    /// submitted with the report, then a fresh one from the classifier.
    async fn classification_for(
        &self,
        trigger: &Trigger,
        report: &Report,
    ) -> Result<Classification, EnrichmentError> {
        let provided = trigger.classification.clone().or_else(|| {
            (!self.reclassify_submissions)
                .then(|| report.submitted_classification())
                .flatten()
        });

        let classification = match provided {
            Some(classification) => classification,
            None => self.classify(report).await?,
        };

        if !(0.0..=1.0).contains(&classification.confidence) {
            return Err(EnrichmentError::Malformed {
                id: report.id,
                reason: format!(
                    "confidence {} is outside [0, 1]",
                    classification.confidence
                ),
            });
        }

        Ok(classification)
    }

    async fn classify(&self, report: &Report) -> Result<Classification, EnrichmentError> {
        let image = ImagePayload::from_reference(&report.image_before_url).ok_or_else(|| {
            EnrichmentError::Malformed {
                id: report.id,
                reason: "before image is neither a data URI nor a URL".to_owned(),
            }
        })?;

        metrics::counter!("report_enrichment_classifier_calls_total").increment(1);

        let classification =
            tokio::time::timeout(self.classify_timeout, self.classifier.classify(&image))
                .await
                .map_err(|_| ClassificationError::Timeout(self.classify_timeout))??;

        Ok(classification)
    }

    async fn fail(&self, id: Uuid, error: EnrichmentError) -> TriggerOutcome {
        // A missing report has nothing to mark.
        if matches!(error, EnrichmentError::NotFound(_)) {
            return TriggerOutcome::Failed {
                error,
                status_marked: false,
            };
        }

        match self.mark_failed(id).await {
            FailureMark::Marked => TriggerOutcome::Failed {
                error,
                status_marked: true,
            },
            FailureMark::AlreadyCompleted => {
                info!(
                    report_id = %id,
                    "enrichment failed after the report was completed elsewhere: {}",
                    error
                );
                TriggerOutcome::LostRace
            }
            FailureMark::NotMarked => TriggerOutcome::Failed {
                error,
                status_marked: false,
            },
        }
    }

    /// Move a report to `failed`, retrying with backoff. Giving up leaves the report stuck in
    /// `processing`, which needs an operator.
    async fn mark_failed(&self, id: Uuid) -> FailureMark {
        for attempt in 1..=self.failure_mark_attempts {
            match with_timeout(
                self.store_timeout,
                self.store.mark_status(id, PipelineStatus::Failed),
            )
            .await
            {
                Ok(()) => return FailureMark::Marked,
                Err(error) if error.is_conflict() => return FailureMark::AlreadyCompleted,
                Err(error) if error.is_not_found() => return FailureMark::NotMarked,
                Err(error) => {
                    warn!(
                        report_id = %id,
                        attempt,
                        "failed to mark report as failed: {}",
                        error
                    );

                    if attempt < self.failure_mark_attempts {
                        tokio::time::sleep(self.failure_retry.retry_interval(attempt)).await;
                    }
                }
            }
        }

        metrics::counter!("report_enrichment_stuck_total").increment(1);
        error!(
            report_id = %id,
            attempts = self.failure_mark_attempts,
            alert = true,
            "report could not be marked as failed and may be stuck in processing"
        );

        FailureMark::NotMarked
    }
}
