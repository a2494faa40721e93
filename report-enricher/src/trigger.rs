//! # Trigger
//!
//! Requests to enrich one report, the queue they travel through, and the worker consuming them.
//!
//! Producers (the HTTP hook endpoint and the sweeper) never wait on enrichment: they hand a
//! `Trigger` to a bounded queue and return. Delivery is at-least-once, so the same report may be
//! triggered more than once and the orchestrator must treat repeats as no-ops.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use report_common::health::HealthHandle;
use report_common::report::Classification;
use serde::{Deserialize, Serialize};
use tokio::sync::{self, mpsc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{TriggerQueueError, WorkerError};
use crate::orchestrator::{Orchestrator, TriggerOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// A regular, possibly repeated, delivery for a new report.
    #[default]
    Delivery,
    /// An explicit request to enrich a report again after it failed.
    Reenrich,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Delivery => "delivery",
            TriggerMode::Reenrich => "reenrich",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub report_id: Uuid,
    /// A classification computed upstream. When set, the classifier is not called.
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub mode: TriggerMode,
}

impl Trigger {
    pub fn delivery(report_id: Uuid) -> Self {
        Self {
            report_id,
            classification: None,
            mode: TriggerMode::Delivery,
        }
    }

    pub fn reenrich(report_id: Uuid) -> Self {
        Self {
            report_id,
            classification: None,
            mode: TriggerMode::Reenrich,
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }
}

/// A producer of triggers the worker can consume.
#[async_trait]
pub trait TriggerSource: Send {
    /// Wait for the next trigger. Returns `None` once the source is exhausted.
    async fn next_trigger(&mut self) -> Option<Trigger>;
}

/// Producer half of the in-process trigger queue.
#[derive(Clone)]
pub struct TriggerSender {
    sender: mpsc::Sender<Trigger>,
}

impl TriggerSender {
    /// Queue a trigger without waiting. Fails if the queue is full so that the caller can redeliver
    /// later instead of blocking.
    pub fn submit(&self, trigger: Trigger) -> Result<(), TriggerQueueError> {
        self.sender.try_send(trigger).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => TriggerQueueError::Full,
            mpsc::error::TrySendError::Closed(_) => TriggerQueueError::Closed,
        })
    }
}

/// Consumer half of the in-process trigger queue.
pub struct ChannelTriggerSource {
    receiver: mpsc::Receiver<Trigger>,
}

#[async_trait]
impl TriggerSource for ChannelTriggerSource {
    async fn next_trigger(&mut self) -> Option<Trigger> {
        self.receiver.recv().await
    }
}

/// Build a bounded trigger queue.
pub fn trigger_channel(capacity: usize) -> (TriggerSender, ChannelTriggerSource) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));

    (TriggerSender { sender }, ChannelTriggerSource { receiver })
}

/// A worker consuming a `TriggerSource` and spawning one task per trigger, up to
/// `max_concurrent_jobs` at a time.
pub struct EnrichmentWorker<S> {
    source: S,
    orchestrator: Arc<Orchestrator>,
    /// How long to wait for a trigger before reporting liveness again.
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
}

impl<S: TriggerSource> EnrichmentWorker<S> {
    pub fn new(
        source: S,
        orchestrator: Arc<Orchestrator>,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            source,
            orchestrator,
            poll_interval,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            liveness,
        }
    }

    async fn wait_for_trigger(&mut self) -> Option<Trigger> {
        loop {
            self.liveness.report_healthy();

            match tokio::time::timeout(self.poll_interval, self.source.next_trigger()).await {
                Ok(trigger) => return trigger,
                Err(_) => continue,
            }
        }
    }

    /// Run until the source is exhausted, then wait for in-flight triggers to finish.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let max_concurrent_jobs = self.max_concurrent_jobs;
        let report_semaphore_utilization = |semaphore: &sync::Semaphore| {
            metrics::gauge!("report_enrichment_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / max_concurrent_jobs as f64,
            );
        };

        loop {
            report_semaphore_utilization(&semaphore);

            let Some(trigger) = self.wait_for_trigger().await else {
                break;
            };

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::SemaphoreClosed)?;
            let orchestrator = self.orchestrator.clone();

            tokio::spawn(async move {
                let report_id = trigger.report_id;
                let outcome = orchestrator.handle(trigger).await;
                drop(permit);

                if let TriggerOutcome::Failed {
                    error,
                    status_marked: false,
                } = &outcome
                {
                    error!(report_id = %report_id, "enrichment failed without a status update: {}", error);
                }
            });
        }

        debug!("trigger source exhausted, draining in-flight triggers");
        let permits = u32::try_from(self.max_concurrent_jobs).unwrap_or(u32::MAX);
        let _drained = semaphore
            .acquire_many(permits)
            .await
            .map_err(|_| WorkerError::SemaphoreClosed)?;

        Ok(())
    }
}
