//! A `ReportStore` backed by the `reports` table in PostgreSQL.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::policy::{Role, RoleDirectory};
use crate::report::{
    Category, Enrichment, EnrichmentResult, PipelineStatus, Report, ReportStatus, Resolution,
    RiskLevel,
};
use crate::store::{ReportStore, StoreError, StoreResult};

/// A report as stored in a single `reports` row.
#[derive(sqlx::FromRow, Debug)]
struct ReportRow {
    id: Uuid,
    category: Option<String>,
    confidence: Option<f64>,
    latitude: f64,
    longitude: f64,
    address: Option<String>,
    image_before_url: String,
    created_at: DateTime<Utc>,
    user_id: Option<Uuid>,
    ai_risk_level: Option<RiskLevel>,
    ai_health_flag: Option<bool>,
    ai_environment_flag: Option<bool>,
    ai_severity_score: Option<i16>,
    ai_ward: Option<String>,
    ai_department: Option<String>,
    ai_enriched_at: Option<DateTime<Utc>>,
    ai_pipeline_status: PipelineStatus,
    ai_pipeline_updated_at: DateTime<Utc>,
    status: ReportStatus,
    assigned_at: Option<DateTime<Utc>>,
    in_progress_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
    image_after_url: Option<String>,
    citizen_verified: Option<bool>,
    citizen_feedback: Option<String>,
}

impl TryFrom<ReportRow> for Report {
    type Error = StoreError;

    /// Enrichment columns must be either all null or all set.
    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let enrichment = match (
            row.ai_risk_level,
            row.ai_health_flag,
            row.ai_environment_flag,
            row.ai_severity_score,
            row.ai_ward,
            row.ai_department,
            row.ai_enriched_at,
        ) {
            (
                Some(risk_level),
                Some(health_hazard),
                Some(environment_hazard),
                Some(severity),
                Some(ward),
                Some(department),
                Some(enriched_at),
            ) => {
                let severity = u8::try_from(severity).map_err(|_| StoreError::Malformed {
                    id: row.id,
                    reason: format!("severity {severity} out of range"),
                })?;

                Some(Enrichment {
                    result: EnrichmentResult {
                        severity,
                        risk_level,
                        health_hazard,
                        environment_hazard,
                        ward,
                        department,
                    },
                    enriched_at,
                })
            }
            (None, None, None, None, None, None, None) => None,
            _ => {
                return Err(StoreError::Malformed {
                    id: row.id,
                    reason: "enrichment columns are partially set".to_owned(),
                })
            }
        };

        Ok(Report {
            id: row.id,
            category: row.category.as_deref().map(Category::normalize),
            confidence: row.confidence,
            latitude: row.latitude,
            longitude: row.longitude,
            address: row.address,
            image_before_url: row.image_before_url,
            created_at: row.created_at,
            user_id: row.user_id,
            enrichment,
            pipeline_status: row.ai_pipeline_status,
            pipeline_updated_at: row.ai_pipeline_updated_at,
            resolution: Resolution {
                status: row.status,
                assigned_at: row.assigned_at,
                in_progress_at: row.in_progress_at,
                resolved_at: row.resolved_at,
                image_after_url: row.image_after_url,
                citizen_verified: row.citizen_verified,
                citizen_feedback: row.citizen_feedback,
            },
        })
    }
}

/// A `ReportStore` backed by PostgreSQL. Cheap to clone.
#[derive(Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    /// Initialize a new PgReportStore, lazily connecting to the database at `url`.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve why a guarded update touched no rows: the report is either gone, or its status
    /// did not match.
    async fn explain_miss(&self, id: Uuid, expected: PipelineStatus) -> StoreError {
        let current: Result<Option<PipelineStatus>, sqlx::Error> =
            sqlx::query_scalar("SELECT ai_pipeline_status FROM reports WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(Some(actual)) => StoreError::Conflict {
                id,
                expected,
                actual,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(error) => StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            },
        }
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn fetch(&self, id: Uuid) -> StoreResult<Report> {
        let row: Option<ReportRow> = sqlx::query_as(
            r#"
SELECT
    *
FROM
    reports
WHERE
    id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn apply_enrichment(
        &self,
        id: Uuid,
        result: &EnrichmentResult,
        expected: PipelineStatus,
    ) -> StoreResult<()> {
        // The status check and the write are one statement, so concurrent writers expecting the
        // same status serialize on the row lock and only the first one matches.
        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
UPDATE
    reports
SET
    ai_risk_level = $2,
    ai_health_flag = $3,
    ai_environment_flag = $4,
    ai_severity_score = $5,
    ai_ward = $6,
    ai_department = $7,
    ai_enriched_at = NOW(),
    ai_pipeline_status = 'completed'::pipeline_status,
    ai_pipeline_updated_at = NOW()
WHERE
    id = $1
    AND ai_pipeline_status = $8
RETURNING
    id
            "#,
        )
        .bind(id)
        .bind(result.risk_level)
        .bind(result.health_hazard)
        .bind(result.environment_hazard)
        .bind(i16::from(result.severity))
        .bind(&result.ward)
        .bind(&result.department)
        .bind(expected)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        match updated {
            Some(_) => Ok(()),
            None => Err(self.explain_miss(id, expected).await),
        }
    }

    async fn mark_status(&self, id: Uuid, status: PipelineStatus) -> StoreResult<()> {
        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
UPDATE
    reports
SET
    ai_pipeline_status = $2,
    ai_pipeline_updated_at = NOW()
WHERE
    id = $1
    AND (ai_pipeline_status <> 'completed'::pipeline_status OR $2 = 'completed'::pipeline_status)
RETURNING
    id
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        match updated {
            Some(_) => Ok(()),
            None => Err(self.explain_miss(id, status).await),
        }
    }

    async fn list_stale(
        &self,
        status: PipelineStatus,
        before: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<Uuid>> {
        sqlx::query_scalar(
            r#"
SELECT
    id
FROM
    reports
WHERE
    ai_pipeline_status = $1
    AND ai_pipeline_updated_at < $2
ORDER BY
    ai_pipeline_updated_at ASC
LIMIT $3
            "#,
        )
        .bind(status)
        .bind(before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }
}

#[async_trait]
impl RoleDirectory for PgReportStore {
    async fn roles_for(&self, user_id: Uuid) -> StoreResult<Vec<Role>> {
        sqlx::query_scalar("SELECT role FROM role_assignments WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::enrich;

    async fn insert_report(db: &PgPool, category: &str, confidence: f64) -> Uuid {
        sqlx::query_scalar(
            r#"
INSERT INTO reports
    (category, confidence, latitude, longitude, image_before_url)
VALUES
    ($1, $2, 18.53, 73.85, 'https://example.com/before.jpg')
RETURNING
    id
            "#,
        )
        .bind(category)
        .bind(confidence)
        .fetch_one(db)
        .await
        .expect("failed to insert report")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_fetch_new_report(db: PgPool) {
        let id = insert_report(&db, "Burning Garbage", 0.9).await;
        let store = PgReportStore::new_from_pool(db);

        let report = store.fetch(id).await.expect("failed to fetch report");

        assert_eq!(report.category, Some(Category::BurningGarbage));
        assert_eq!(report.pipeline_status, PipelineStatus::Pending);
        assert_eq!(report.enrichment, None);
        assert_eq!(report.resolution.status, ReportStatus::Pending);

        let error = store.fetch(Uuid::now_v7()).await.expect_err("no such report");
        assert!(error.is_not_found());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_conditional_enrichment(db: PgPool) {
        let id = insert_report(&db, "burning_garbage", 0.9).await;
        let store = PgReportStore::new_from_pool(db);
        let result = enrich(Category::BurningGarbage, 0.9, 18.53);

        let error = store
            .apply_enrichment(id, &result, PipelineStatus::Processing)
            .await
            .expect_err("report is still pending");
        assert!(error.is_conflict());

        store
            .mark_status(id, PipelineStatus::Processing)
            .await
            .expect("failed to mark processing");
        store
            .apply_enrichment(id, &result, PipelineStatus::Processing)
            .await
            .expect("failed to apply enrichment");

        let report = store.fetch(id).await.unwrap();
        assert_eq!(report.pipeline_status, PipelineStatus::Completed);
        assert_eq!(report.enrichment.unwrap().result, result);

        let error = store
            .apply_enrichment(id, &result, PipelineStatus::Processing)
            .await
            .expect_err("second write must lose");
        assert!(matches!(
            error,
            StoreError::Conflict {
                actual: PipelineStatus::Completed,
                ..
            }
        ));

        let error = store
            .mark_status(id, PipelineStatus::Failed)
            .await
            .expect_err("completed is terminal");
        assert!(error.is_conflict());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_concurrent_enrichment_completes_once(db: PgPool) {
        let id = insert_report(&db, "dead_animal", 0.95).await;
        let store = PgReportStore::new_from_pool(db);
        store
            .mark_status(id, PipelineStatus::Processing)
            .await
            .expect("failed to mark processing");
        let result = enrich(Category::DeadAnimal, 0.95, 18.53);

        let (first, second) = tokio::join!(
            store.apply_enrichment(id, &result, PipelineStatus::Processing),
            store.apply_enrichment(id, &result, PipelineStatus::Processing),
        );

        let lost = match (first, second) {
            (Ok(()), Err(error)) | (Err(error), Ok(())) => error,
            other => panic!("expected exactly one write to succeed, got {other:?}"),
        };
        assert!(matches!(
            lost,
            StoreError::Conflict {
                expected: PipelineStatus::Processing,
                actual: PipelineStatus::Completed,
                ..
            }
        ));

        let report = store.fetch(id).await.unwrap();
        assert_eq!(report.pipeline_status, PipelineStatus::Completed);
        assert_eq!(report.enrichment.unwrap().result, result);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_partial_enrichment_is_malformed(db: PgPool) {
        let id = insert_report(&db, "other", 0.1).await;
        sqlx::query("UPDATE reports SET ai_ward = 'Zone North' WHERE id = $1")
            .bind(id)
            .execute(&db)
            .await
            .unwrap();
        let store = PgReportStore::new_from_pool(db);

        let error = store.fetch(id).await.expect_err("row is half enriched");
        assert!(matches!(error, StoreError::Malformed { .. }));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_list_stale_and_roles(db: PgPool) {
        let id = insert_report(&db, "other", 0.1).await;
        sqlx::query(
            "UPDATE reports SET ai_pipeline_updated_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
        )
        .bind(id)
        .execute(&db)
        .await
        .unwrap();
        let user = Uuid::now_v7();
        sqlx::query("INSERT INTO role_assignments (user_id, role) VALUES ($1, 'staff')")
            .bind(user)
            .execute(&db)
            .await
            .unwrap();
        let store = PgReportStore::new_from_pool(db);

        let stale = store
            .list_stale(
                PipelineStatus::Pending,
                Utc::now() - chrono::Duration::minutes(5),
                10,
            )
            .await
            .unwrap();
        assert_eq!(stale, vec![id]);

        assert_eq!(store.roles_for(user).await.unwrap(), vec![Role::Staff]);
    }
}
