//! Enrich submitted reports: classify, score and route them, driving each through the pipeline
//! state machine.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::select_all;
use tracing_subscriber::EnvFilter;

use report_common::classifier::HttpClassifier;
use report_common::health::HealthRegistry;
use report_common::metrics::{serve, setup_metrics_routes};
use report_common::policy::RolePolicy;
use report_common::retry::RetryPolicy;
use report_common::rules::RuleSet;
use report_common::store::postgres::PgReportStore;
use report_enricher::api::{add_routes, AppState};
use report_enricher::config::Config;
use report_enricher::orchestrator::Orchestrator;
use report_enricher::sweeper::{sweep_loop, Sweeper};
use report_enricher::trigger::{trigger_channel, EnrichmentWorker};

type Task = Pin<Box<dyn Future<Output = (&'static str, Result<()>)> + Send>>;

/// Liveness deadline for a loop ticking every `interval`.
fn liveness_deadline(interval: Duration) -> Duration {
    interval.saturating_mul(3).max(Duration::from_secs(30))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = Arc::new(PgReportStore::new(
        &config.database_url,
        config.max_pg_connections,
    )?);
    let classifier = Arc::new(HttpClassifier::new(
        url::Url::parse(config.classifier_url.as_str())?,
        config.classifier_api_key.as_ref().map(|key| key.as_str()),
        config.classify_timeout.0,
    )?);

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let orchestrator = Arc::new(
        Orchestrator::new(store.clone(), classifier)
            .with_rules(RuleSet::default().with_ward_split_latitude(config.ward_split_latitude))
            .with_timeouts(
                config.store_timeout.0,
                config.classify_timeout.0,
                config.invocation_deadline.0,
            )
            .with_failure_retry(retry_policy, config.failure_mark_attempts)
            .reclassify_submissions(config.reclassify_submissions),
    );

    let liveness = HealthRegistry::new("liveness");
    let (triggers, source) = trigger_channel(config.trigger_queue_capacity);

    let worker = EnrichmentWorker::new(
        source,
        orchestrator.clone(),
        config.poll_interval.0,
        config.max_concurrent_jobs,
        liveness.register("worker", liveness_deadline(config.poll_interval.0)),
    );

    let sweeper = Sweeper::new(
        store.clone(),
        triggers.clone(),
        config.store_timeout.0,
        config.pending_window_secs.0,
        config.processing_deadline_secs.0,
        config.sweep_batch_size,
    );
    let sweeper_liveness = liveness.register(
        "sweeper",
        liveness_deadline(config.sweep_interval_secs.0),
    );

    let state = AppState {
        orchestrator,
        triggers,
        store: store.clone(),
        policy: RolePolicy::new(store),
        store_timeout: config.store_timeout.0,
    };
    let app = add_routes(
        Router::new(),
        state,
        liveness,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = setup_metrics_routes(app)?;
    let bind = config.bind();
    let sweep_interval = config.sweep_interval_secs.0;

    let tasks: Vec<Task> = vec![
        Box::pin(async move {
            let result = worker.run().await.map_err(eyre::Report::from);
            ("enrichment worker", result)
        }),
        Box::pin(async move {
            sweep_loop(sweeper, sweep_interval, sweeper_liveness).await;
            ("sweeper", Ok(()))
        }),
        Box::pin(async move {
            let result = serve(app, &bind).await.map_err(eyre::Report::from);
            ("http server", result)
        }),
    ];

    let ((task, result), _, _) = select_all(tasks).await;
    match result {
        Ok(()) => tracing::error!("report-enricher {} exited", task),
        Err(e) => tracing::error!("report-enricher {} failed: {}", task, e),
    }

    Ok(())
}
