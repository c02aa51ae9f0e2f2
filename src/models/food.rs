use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::ingredient::{canonical_name, Ingredient, Zone, ZoneAssignment};

/// Lifecycle status of a food record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FoodStatus {
    Analyzing,
    Processed,
    PendingReview,
}

/// A logged meal and the ingredients extracted from its photo.
///
/// `retry_count` and `next_eligible_at` drive the recovery engine's backoff and
/// are persisted so recovery survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoodRecord {
    pub id: Uuid,
    pub identifier: String,
    pub meal_summary: Option<String>,
    pub ingredients: Vec<Ingredient>,
    /// Compressed photo as a data URI, held until the vision step succeeds.
    #[serde(skip)]
    pub pending_image: Option<String>,
    pub status: FoodStatus,
    pub retry_count: i32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FoodRecord {
    /// Fresh record for a photo that has just been submitted.
    pub fn new(identifier: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identifier: identifier.into(),
            meal_summary: None,
            ingredients: Vec::new(),
            pending_image: None,
            status: FoodStatus::Analyzing,
            retry_count: 0,
            next_eligible_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_unzoned(&self) -> bool {
        self.ingredients.iter().any(Ingredient::is_unzoned)
    }

    pub fn unzoned_names(&self) -> Vec<String> {
        self.ingredients
            .iter()
            .filter(|i| i.is_unzoned())
            .map(|i| i.name.clone())
            .collect()
    }

    /// Still analyzing, or processed with ingredients the classifier never zoned.
    pub fn needs_recovery(&self) -> bool {
        match self.status {
            FoodStatus::Analyzing => true,
            FoodStatus::Processed => self.has_unzoned(),
            FoodStatus::PendingReview => false,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.needs_recovery() && self.next_eligible_at.map_or(true, |at| at <= now)
    }

    /// Fill zones for still-unzoned ingredients from classifier output.
    ///
    /// Names match case-insensitively; `unzoned` assignments are ignored.
    /// Returns how many ingredients gained a zone.
    pub fn apply_zones(&mut self, assignments: &[ZoneAssignment]) -> usize {
        let by_name: HashMap<String, Zone> = assignments
            .iter()
            .filter(|a| a.zone != Zone::Unzoned)
            .map(|a| (canonical_name(&a.name), a.zone))
            .collect();

        let mut zoned = 0;
        for ingredient in self.ingredients.iter_mut().filter(|i| i.is_unzoned()) {
            if let Some(zone) = by_name.get(&ingredient.name) {
                ingredient.zone = *zone;
                zoned += 1;
            }
        }
        zoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record_with(names: &[&str]) -> FoodRecord {
        let mut record = FoodRecord::new("user-1", Utc::now());
        record.ingredients = names
            .iter()
            .map(|n| Ingredient::unzoned(*n, false, ""))
            .collect();
        record
    }

    #[test]
    fn test_new_record_is_analyzing() {
        let record = FoodRecord::new("user-1", Utc::now());
        assert_eq!(record.status, FoodStatus::Analyzing);
        assert_eq!(record.retry_count, 0);
        assert!(record.needs_recovery());
    }

    #[test]
    fn test_apply_zones_matches_case_insensitively() {
        let mut record = record_with(&["rice", "chili"]);
        let zoned = record.apply_zones(&[
            ZoneAssignment { name: "Rice".into(), zone: Zone::Green },
            ZoneAssignment { name: "chili".into(), zone: Zone::Unzoned },
        ]);
        assert_eq!(zoned, 1);
        assert_eq!(record.ingredients[0].zone, Zone::Green);
        assert!(record.has_unzoned());
        assert_eq!(record.unzoned_names(), vec!["chili".to_string()]);
    }

    #[test]
    fn test_apply_zones_leaves_existing_zones() {
        let mut record = record_with(&["rice"]);
        record.ingredients[0].zone = Zone::Yellow;
        let zoned = record.apply_zones(&[ZoneAssignment { name: "rice".into(), zone: Zone::Red }]);
        assert_eq!(zoned, 0);
        assert_eq!(record.ingredients[0].zone, Zone::Yellow);
    }

    #[test]
    fn test_processed_without_unzoned_needs_no_recovery() {
        let mut record = record_with(&["rice"]);
        record.status = FoodStatus::Processed;
        assert!(record.needs_recovery());
        record.ingredients[0].zone = Zone::Green;
        assert!(!record.needs_recovery());
    }

    #[test]
    fn test_pending_review_never_eligible() {
        let mut record = record_with(&["rice"]);
        record.status = FoodStatus::PendingReview;
        assert!(!record.is_eligible(Utc::now()));
    }

    #[test]
    fn test_backoff_gates_eligibility() {
        let now = Utc::now();
        let mut record = record_with(&["rice"]);
        record.next_eligible_at = Some(now + Duration::seconds(30));
        assert!(!record.is_eligible(now));
        assert!(record.is_eligible(now + Duration::seconds(30)));
    }

    #[test]
    fn test_status_round_trips_as_snake_case() {
        assert_eq!(FoodStatus::PendingReview.to_string(), "pending_review");
        assert_eq!("processed".parse::<FoodStatus>().unwrap(), FoodStatus::Processed);
    }
}
