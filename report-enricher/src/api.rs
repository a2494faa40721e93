use std::sync::Arc;
use std::time;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    routing, Json, Router,
};
use chrono::{DateTime, Utc};
use report_common::health::HealthRegistry;
use report_common::policy::{Action, RolePolicy};
use report_common::report::{Classification, Enrichment, PipelineStatus};
use report_common::store::{with_timeout, ReportStore};
use serde::Serialize;
use serde_derive::Deserialize;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{EnrichmentError, TriggerQueueError};
use crate::orchestrator::{Orchestrator, TriggerOutcome};
use crate::trigger::{Trigger, TriggerMode, TriggerSender};

/// Header carrying the id of the authenticated staff member, set by the gateway in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub triggers: TriggerSender,
    pub store: Arc<dyn ReportStore>,
    pub policy: RolePolicy,
    /// Deadline for each store call made directly by a handler.
    pub store_timeout: time::Duration,
}

/// Body of a trigger delivered by the report store hook.
#[derive(Deserialize, Serialize, Debug)]
pub struct TriggerRequest {
    pub report_id: Uuid,
    #[serde(default)]
    pub classification: Option<Classification>,
}

impl From<TriggerRequest> for Trigger {
    fn from(request: TriggerRequest) -> Self {
        Trigger {
            report_id: request.report_id,
            classification: request.classification,
            mode: TriggerMode::Delivery,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct EnrichResponse {
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_status: Option<PipelineStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PipelineResponse {
    pub report_id: Uuid,
    pub pipeline_status: PipelineStatus,
    pub pipeline_updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn add_routes(
    router: Router,
    state: AppState,
    liveness: HealthRegistry,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let pipeline = Router::new()
        .route("/enrich", routing::post(enrich))
        .route("/enqueue", routing::post(enqueue))
        .route("/reports/:report_id/reenrich", routing::post(reenrich))
        .route("/reports/:report_id/pipeline", routing::get(pipeline))
        .with_state(state)
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size));

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .merge(pipeline)
}

pub async fn index() -> &'static str {
    "report enricher"
}

/// Run a delivery inline and answer with its outcome. Safe to call repeatedly.
async fn enrich(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> (StatusCode, Json<EnrichResponse>) {
    debug!(report_id = %request.report_id, "received enrichment trigger");

    let outcome = state.orchestrator.handle(request.into()).await;

    outcome_response(outcome)
}

/// Queue a delivery and return immediately. This is what the report store hook calls.
async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<StatusCode, ApiError> {
    match state.triggers.submit(request.into()) {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(error @ TriggerQueueError::Full) => Err(unavailable(error)),
        Err(error @ TriggerQueueError::Closed) => Err(internal_error(error)),
    }
}

/// Enrich a failed report again, on behalf of an authorized staff member.
async fn reenrich(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<EnrichResponse>), ApiError> {
    authorize(&state, &headers, Action::Reenrich).await?;

    let outcome = state.orchestrator.handle(Trigger::reenrich(report_id)).await;

    Ok(outcome_response(outcome))
}

async fn pipeline(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<PipelineResponse>, ApiError> {
    authorize(&state, &headers, Action::ViewPipeline).await?;

    let report = with_timeout(state.store_timeout, state.store.fetch(report_id))
        .await
        .map_err(|error| {
            if error.is_not_found() {
                not_found(error)
            } else {
                internal_error(error)
            }
        })?;

    Ok(Json(PipelineResponse {
        report_id: report.id,
        pipeline_status: report.pipeline_status,
        pipeline_updated_at: report.pipeline_updated_at,
        enrichment: report.enrichment,
    }))
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    action: Action,
) -> Result<(), ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: format!("missing or invalid {USER_ID_HEADER} header"),
                }),
            )
        })?;

    match with_timeout(state.store_timeout, state.policy.allows(user_id, action)).await {
        Ok(true) => Ok(()),
        Ok(false) => Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: format!("user is not allowed to {action:?}"),
            }),
        )),
        Err(error) => Err(internal_error(error)),
    }
}

fn outcome_response(outcome: TriggerOutcome) -> (StatusCode, Json<EnrichResponse>) {
    let status = match outcome.error() {
        None => StatusCode::OK,
        Some(EnrichmentError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(EnrichResponse {
            outcome: outcome.as_str().to_owned(),
            pipeline_status: outcome.pipeline_status(),
            error: outcome.error().map(ToString::to_string),
        }),
    )
}

fn not_found<E>(err: E) -> ApiError
where
    E: std::error::Error,
{
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn unavailable<E>(err: E) -> ApiError
where
    E: std::error::Error,
{
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn internal_error<E>(err: E) -> ApiError
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
