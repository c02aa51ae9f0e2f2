use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{FoodRepository, RecoveryCounts, RepositoryError};
use crate::models::food::{FoodRecord, FoodStatus};

/// Process-local food record store for single-node runs and tests.
#[derive(Default)]
pub struct MemoryFoodRepository {
    records: RwLock<HashMap<Uuid, FoodRecord>>,
}

impl MemoryFoodRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl FoodRepository for MemoryFoodRepository {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, record: &FoodRecord) -> Result<(), RepositoryError> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<FoodRecord>, RepositoryError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update(&self, record: &FoodRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(record.id)),
        }
    }

    async fn fetch_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FoodRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut eligible: Vec<FoodRecord> = records
            .values()
            .filter(|r| r.is_eligible(now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn recovery_counts(&self, now: DateTime<Utc>) -> Result<RecoveryCounts, RepositoryError> {
        let records = self.records.read().await;
        let mut counts = RecoveryCounts::default();
        for record in records.values() {
            let needs_recovery = record.needs_recovery();
            match record.status {
                FoodStatus::Analyzing => counts.stuck += 1,
                FoodStatus::Processed if needs_recovery => counts.unzoned += 1,
                FoodStatus::PendingReview => counts.pending_review += 1,
                FoodStatus::Processed => {}
            }
            if needs_recovery && record.retry_count > 0 {
                counts.failed += 1;
            }
            if needs_recovery && record.next_eligible_at.is_some_and(|at| at > now) {
                counts.awaiting_backoff += 1;
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ingredient::{Ingredient, Zone};
    use chrono::Duration;

    fn record(status: FoodStatus, zones: &[Zone], created_offset_secs: i64) -> FoodRecord {
        let now = Utc::now();
        let mut record = FoodRecord::new("user-1", now + Duration::seconds(created_offset_secs));
        record.status = status;
        record.ingredients = zones
            .iter()
            .enumerate()
            .map(|(i, zone)| Ingredient {
                name: format!("item-{i}"),
                zone: *zone,
                organic: false,
                category: String::new(),
            })
            .collect();
        record
    }

    #[tokio::test]
    async fn test_create_then_update_is_visible() {
        let repo = MemoryFoodRepository::new();
        let mut food = record(FoodStatus::Analyzing, &[Zone::Unzoned], 0);
        tokio_test::assert_ok!(repo.create(&food).await);

        food.status = FoodStatus::Processed;
        food.ingredients[0].zone = Zone::Red;
        tokio_test::assert_ok!(repo.update(&food).await);

        let stored = tokio_test::assert_ok!(repo.get(food.id).await);
        assert_eq!(stored, Some(food));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_record_errors() {
        let repo = MemoryFoodRepository::new();
        let missing = record(FoodStatus::Analyzing, &[], 0);
        assert!(matches!(
            repo.update(&missing).await,
            Err(RepositoryError::NotFound(id)) if id == missing.id
        ));
    }

    #[tokio::test]
    async fn test_fetch_retryable_filters_and_orders() {
        let repo = MemoryFoodRepository::new();
        let now = Utc::now();

        let newest = record(FoodStatus::Analyzing, &[Zone::Unzoned], -10);
        let oldest = record(FoodStatus::Processed, &[Zone::Green, Zone::Unzoned], -300);
        let done = record(FoodStatus::Processed, &[Zone::Green], -200);
        let parked = record(FoodStatus::PendingReview, &[Zone::Unzoned], -100);
        let mut backing_off = record(FoodStatus::Analyzing, &[Zone::Unzoned], -50);
        backing_off.next_eligible_at = Some(now + Duration::seconds(60));

        for r in [&newest, &oldest, &done, &parked, &backing_off] {
            repo.create(r).await.unwrap();
        }

        let batch = repo.fetch_retryable(now, 10).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![oldest.id, newest.id]);

        let limited = repo.fetch_retryable(now, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, oldest.id);

        let counts = repo.recovery_counts(now).await.unwrap();
        assert_eq!(counts.stuck, 2);
        assert_eq!(counts.unzoned, 1);
        assert_eq!(counts.awaiting_backoff, 1);
        assert_eq!(counts.pending_review, 1);
        assert_eq!(counts.failed, 0);
    }
}
