use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::{FoodRepository, RecoveryCounts, RepositoryError};
use crate::models::food::{FoodRecord, FoodStatus};
use crate::models::ingredient::Ingredient;

/// PostgreSQL-backed food record store.
pub struct PgFoodRepository {
    pool: PgPool,
}

impl PgFoodRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> Result<FoodRecord, RepositoryError> {
    let status_str: String = row.try_get("status")?;
    let status = FoodStatus::from_str(&status_str)
        .map_err(|_| RepositoryError::Corrupt(format!("unknown status '{status_str}'")))?;
    let Json(ingredients): Json<Vec<Ingredient>> = row.try_get("ingredients")?;

    Ok(FoodRecord {
        id: row.try_get("id")?,
        identifier: row.try_get("identifier")?,
        meal_summary: row.try_get("meal_summary")?,
        ingredients,
        pending_image: row.try_get("pending_image")?,
        status,
        retry_count: row.try_get("retry_count")?,
        next_eligible_at: row.try_get("next_eligible_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl FoodRepository for PgFoodRepository {
    fn name(&self) -> &'static str {
        "postgres"
    }

    /// Insert a new food record
    async fn create(&self, record: &FoodRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO food_records (id, identifier, meal_summary, ingredients, status,
                                      retry_count, next_eligible_at, last_error,
                                      created_at, updated_at, pending_image)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(&record.identifier)
        .bind(&record.meal_summary)
        .bind(Json(&record.ingredients))
        .bind(record.status.to_string())
        .bind(record.retry_count)
        .bind(record.next_eligible_at)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.pending_image)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a food record by ID
    async fn get(&self, id: Uuid) -> Result<Option<FoodRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, identifier, meal_summary, ingredients, status, retry_count,
                   next_eligible_at, last_error, created_at, updated_at, pending_image
            FROM food_records
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn update(&self, record: &FoodRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE food_records
            SET meal_summary = $2,
                ingredients = $3,
                status = $4,
                retry_count = $5,
                next_eligible_at = $6,
                last_error = $7,
                updated_at = $8,
                pending_image = $9
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.meal_summary)
        .bind(Json(&record.ingredients))
        .bind(record.status.to_string())
        .bind(record.retry_count)
        .bind(record.next_eligible_at)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .bind(&record.pending_image)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(record.id));
        }
        Ok(())
    }

    async fn fetch_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FoodRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, identifier, meal_summary, ingredients, status, retry_count,
                   next_eligible_at, last_error, created_at, updated_at, pending_image
            FROM food_records
            WHERE (status = 'analyzing'
                   OR (status = 'processed' AND ingredients @> '[{"zone": "unzoned"}]'::jsonb))
              AND (next_eligible_at IS NULL OR next_eligible_at <= $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn recovery_counts(&self, now: DateTime<Utc>) -> Result<RecoveryCounts, RepositoryError> {
        let row = sqlx::query(
            r#"
            WITH flagged AS (
                SELECT status, retry_count, next_eligible_at,
                       (status = 'analyzing'
                        OR (status = 'processed' AND ingredients @> '[{"zone": "unzoned"}]'::jsonb))
                           AS needs_recovery
                FROM food_records
            )
            SELECT
                COUNT(*) FILTER (WHERE status = 'analyzing') AS stuck,
                COUNT(*) FILTER (WHERE status = 'processed' AND needs_recovery) AS unzoned,
                COUNT(*) FILTER (WHERE needs_recovery AND retry_count > 0) AS failed,
                COUNT(*) FILTER (WHERE needs_recovery AND next_eligible_at > $1) AS awaiting_backoff,
                COUNT(*) FILTER (WHERE status = 'pending_review') AS pending_review
            FROM flagged
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecoveryCounts {
            stuck: row.try_get("stuck")?,
            unzoned: row.try_get("unzoned")?,
            failed: row.try_get("failed")?,
            awaiting_backoff: row.try_get("awaiting_backoff")?,
            pending_review: row.try_get("pending_review")?,
        })
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
