use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::food::FoodRecord;

pub mod memory;
pub mod queries;

pub use memory::MemoryFoodRepository;
pub use queries::PgFoodRepository;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Connect to PostgreSQL when a URL is configured, otherwise keep records in
/// process memory.
pub async fn connect_repository(
    database_url: Option<&str>,
) -> Result<Arc<dyn FoodRepository>, RepositoryError> {
    match database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = init_pool(url).await?;
            tracing::info!("Running database migrations");
            run_migrations(&pool).await?;
            Ok(Arc::new(PgFoodRepository::new(pool)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; food records are kept in memory only");
            Ok(Arc::new(MemoryFoodRepository::new()))
        }
    }
}

/// Record counts surfaced by the recovery monitoring endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCounts {
    /// Status `analyzing`.
    pub stuck: i64,
    /// Processed but still holding unzoned ingredients.
    pub unzoned: i64,
    /// Awaiting recovery after at least one failed attempt.
    pub failed: i64,
    /// Awaiting recovery, but inside a backoff delay.
    pub awaiting_backoff: i64,
    pub pending_review: i64,
}

/// Persistence for food records.
#[async_trait]
pub trait FoodRepository: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, record: &FoodRecord) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<FoodRecord>, RepositoryError>;

    /// Overwrite every mutable field of an existing record.
    async fn update(&self, record: &FoodRecord) -> Result<(), RepositoryError>;

    /// Records needing recovery whose backoff has elapsed, oldest first.
    async fn fetch_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FoodRecord>, RepositoryError>;

    async fn recovery_counts(&self, now: DateTime<Utc>) -> Result<RecoveryCounts, RepositoryError>;

    /// Connectivity check used by the health endpoint.
    async fn ping(&self) -> Result<(), RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Food record {0} not found")]
    NotFound(Uuid),

    #[error("Stored food record is malformed: {0}")]
    Corrupt(String),
}
