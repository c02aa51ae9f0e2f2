//! Background recovery of food records the interactive pipeline left
//! unfinished.
//!
//! Each tick scans a bounded batch of eligible records. A record still waiting
//! on its vision analysis is re-analyzed from the retained photo; a record with
//! unzoned ingredients has only those re-submitted to the classifier. Failures
//! back off exponentially and are parked for manual review once the attempt
//! budget is spent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::db::{FoodRepository, RepositoryError};
use crate::models::food::{FoodRecord, FoodStatus};
use crate::models::ingredient::normalize_ingredients;
use crate::services::clock::{add_duration, Clock};
use crate::services::health_monitor::HealthMonitor;
use crate::services::image_validation::decode_data_uri;
use crate::services::inference::{
    IngredientClassifier, MealVisionAnalyzer, CLASSIFICATION_SERVICE, VISION_SERVICE,
};
use crate::services::rate_limit::{RateLimiter, TrafficClass};

/// Exponential backoff bounded by a maximum delay and attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt with zero-based index `attempt`:
    /// `min(base × multiplier^attempt, max)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub scan_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_size: 10,
            scan_interval: Duration::from_secs(300),
        }
    }
}

/// Outcome of one recovery tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub scanned: u64,
    pub recovered: u64,
    pub retried: u64,
    pub parked: u64,
    /// Skipped this tick because the owner's vision or classification budget
    /// was spent.
    pub deferred: u64,
}

/// Counters accumulated since the engine started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryTotals {
    pub ticks: u64,
    pub scanned: u64,
    pub recovered: u64,
    pub retried: u64,
    pub parked: u64,
    pub deferred: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AtomicTotals {
    ticks: AtomicU64,
    scanned: AtomicU64,
    recovered: AtomicU64,
    retried: AtomicU64,
    parked: AtomicU64,
    deferred: AtomicU64,
    last_tick_ms: AtomicU64,
}

enum RecordOutcome {
    Recovered,
    Retried,
    Parked,
    Deferred,
    Skipped,
}

/// What the inference calls for one record came to.
enum Attempt {
    Succeeded,
    Failed(String),
    Denied(TrafficClass),
}

/// Identifier and class whose budget ran out during the current tick.
type Exhausted = HashSet<(String, TrafficClass)>;

pub struct RecoveryEngine {
    repo: Arc<dyn FoodRepository>,
    vision: Arc<dyn MealVisionAnalyzer>,
    classifier: Arc<dyn IngredientClassifier>,
    limiter: Arc<RateLimiter>,
    monitor: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    totals: AtomicTotals,
}

impl RecoveryEngine {
    pub fn new(
        repo: Arc<dyn FoodRepository>,
        vision: Arc<dyn MealVisionAnalyzer>,
        classifier: Arc<dyn IngredientClassifier>,
        limiter: Arc<RateLimiter>,
        monitor: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            repo,
            vision,
            classifier,
            limiter,
            monitor,
            clock,
            config,
            totals: AtomicTotals::default(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Process one bounded batch of eligible records.
    ///
    /// Only a failure to fetch the batch is returned; a failure to persist a
    /// single record is logged and the rest of the batch continues.
    pub async fn tick(&self) -> Result<TickReport, RepositoryError> {
        let now = self.clock.now();
        let batch = self
            .repo
            .fetch_retryable(now, self.config.batch_size)
            .await?;

        let mut report = TickReport {
            scanned: batch.len() as u64,
            ..TickReport::default()
        };
        let mut exhausted = Exhausted::new();

        for record in batch {
            let food_id = record.id;
            match self.recover_record(record, &mut exhausted).await {
                Ok(RecordOutcome::Recovered) => report.recovered += 1,
                Ok(RecordOutcome::Retried) => report.retried += 1,
                Ok(RecordOutcome::Parked) => report.parked += 1,
                Ok(RecordOutcome::Deferred) => report.deferred += 1,
                Ok(RecordOutcome::Skipped) => {}
                Err(e) => {
                    tracing::error!(food_id = %food_id, error = %e, "Failed to persist recovery outcome");
                }
            }
        }

        self.accumulate(&report, now);
        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                recovered = report.recovered,
                retried = report.retried,
                parked = report.parked,
                deferred = report.deferred,
                "Recovery tick complete"
            );
        } else {
            tracing::debug!("Recovery tick found no eligible records");
        }
        Ok(report)
    }

    async fn recover_record(
        &self,
        mut record: FoodRecord,
        exhausted: &mut Exhausted,
    ) -> Result<RecordOutcome, RepositoryError> {
        let max_retries = i32::try_from(self.config.retry.max_retries).unwrap_or(i32::MAX);

        if !record.needs_recovery() {
            return Ok(RecordOutcome::Skipped);
        }

        if record.retry_count >= max_retries {
            let reason = format!("Recovery failed after {} attempts", record.retry_count);
            self.park(&mut record, &reason).await?;
            return Ok(RecordOutcome::Parked);
        }

        let attempt = if record.ingredients.is_empty() {
            if record.pending_image.is_none() {
                self.park(&mut record, "No photo retained and no ingredients extracted")
                    .await?;
                return Ok(RecordOutcome::Parked);
            }
            match self.reanalyze(&mut record, exhausted).await? {
                Attempt::Succeeded if record.has_unzoned() => {
                    self.reclassify(&mut record, exhausted).await
                }
                other => other,
            }
        } else {
            self.reclassify(&mut record, exhausted).await
        };

        let now = self.clock.now();
        let error = match attempt {
            Attempt::Succeeded => {
                record.status = FoodStatus::Processed;
                record.next_eligible_at = None;
                record.last_error = None;
                record.updated_at = now;
                self.repo.update(&record).await?;
                metrics::counter!("recovery_records_total", "outcome" => "recovered").increment(1);
                tracing::info!(
                    food_id = %record.id,
                    retry_count = record.retry_count,
                    "Recovered food record"
                );
                return Ok(RecordOutcome::Recovered);
            }
            Attempt::Denied(class) => {
                tracing::debug!(
                    food_id = %record.id,
                    identifier = %record.identifier,
                    %class,
                    "Budget spent; deferring recovery"
                );
                metrics::counter!("recovery_records_total", "outcome" => "deferred").increment(1);
                return Ok(RecordOutcome::Deferred);
            }
            Attempt::Failed(error) => error,
        };

        let attempt = u32::try_from(record.retry_count).unwrap_or(0);
        record.retry_count += 1;
        if record.retry_count >= max_retries {
            let reason = format!(
                "Recovery failed after {} attempts: {error}",
                record.retry_count
            );
            self.park(&mut record, &reason).await?;
            return Ok(RecordOutcome::Parked);
        }

        let delay = self.config.retry.next_delay(attempt);
        record.next_eligible_at = Some(add_duration(now, delay));
        record.last_error = Some(error);
        record.updated_at = now;
        self.repo.update(&record).await?;
        metrics::counter!("recovery_records_total", "outcome" => "retried").increment(1);
        tracing::warn!(
            food_id = %record.id,
            retry_count = record.retry_count,
            delay_secs = delay.as_secs(),
            error = record.last_error.as_deref().unwrap_or_default(),
            "Recovery attempt failed; backing off"
        );
        Ok(RecordOutcome::Retried)
    }

    /// Re-run the vision step from the retained photo. Extracted ingredients
    /// are persisted at once so a later classification failure never repeats
    /// the vision call.
    async fn reanalyze(
        &self,
        record: &mut FoodRecord,
        exhausted: &mut Exhausted,
    ) -> Result<Attempt, RepositoryError> {
        let Some(blob) = record.pending_image.as_deref() else {
            return Ok(Attempt::Failed("No photo retained".to_string()));
        };
        let image = match decode_data_uri(blob) {
            Ok(image) => image,
            Err(e) => return Ok(Attempt::Failed(format!("Retained photo is unreadable: {e}"))),
        };

        if !self.admit(&record.identifier, TrafficClass::Vision, exhausted).await {
            return Ok(Attempt::Denied(TrafficClass::Vision));
        }
        let analysis = match self
            .monitor
            .track(VISION_SERVICE, self.vision.analyze_meal(&image.bytes, image.mime))
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => return Ok(Attempt::Failed(e.to_string())),
        };

        record.meal_summary = analysis.meal_summary.filter(|s| !s.trim().is_empty());
        record.ingredients = normalize_ingredients(analysis.ingredients);
        record.pending_image = None;
        record.status = FoodStatus::Processed;
        record.updated_at = self.clock.now();
        self.repo.update(record).await?;
        tracing::info!(
            food_id = %record.id,
            ingredients = record.ingredients.len(),
            "Vision analysis recovered"
        );
        Ok(Attempt::Succeeded)
    }

    /// Re-submit only the still-unzoned ingredients. A reply that leaves any
    /// of them unzoned counts as a failure.
    async fn reclassify(&self, record: &mut FoodRecord, exhausted: &mut Exhausted) -> Attempt {
        if !self
            .admit(&record.identifier, TrafficClass::Classification, exhausted)
            .await
        {
            return Attempt::Denied(TrafficClass::Classification);
        }

        let names = record.unzoned_names();
        match self
            .monitor
            .track(CLASSIFICATION_SERVICE, self.classifier.classify(&names))
            .await
        {
            Ok(assignments) => {
                let zoned = record.apply_zones(&assignments);
                if record.has_unzoned() {
                    Attempt::Failed(format!(
                        "Classification zoned {zoned} of {} ingredients",
                        names.len()
                    ))
                } else {
                    Attempt::Succeeded
                }
            }
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    /// Charge one call to the owner's budget. A denial sticks for the rest of
    /// the tick.
    async fn admit(&self, identifier: &str, class: TrafficClass, exhausted: &mut Exhausted) -> bool {
        let key = (identifier.to_string(), class);
        if exhausted.contains(&key) {
            return false;
        }
        let decision = self.limiter.admit(identifier, class).await;
        if !decision.allowed {
            tracing::debug!(identifier, %class, reset_at = %decision.reset_at, "Recovery budget spent");
            exhausted.insert(key);
        }
        decision.allowed
    }

    async fn park(&self, record: &mut FoodRecord, reason: &str) -> Result<(), RepositoryError> {
        record.status = FoodStatus::PendingReview;
        record.next_eligible_at = None;
        record.last_error = Some(reason.to_string());
        record.updated_at = self.clock.now();
        self.repo.update(record).await?;
        metrics::counter!("recovery_records_total", "outcome" => "parked").increment(1);
        tracing::warn!(
            food_id = %record.id,
            retry_count = record.retry_count,
            reason,
            "Food record parked for manual review"
        );
        Ok(())
    }

    fn accumulate(&self, report: &TickReport, now: DateTime<Utc>) {
        let t = &self.totals;
        t.ticks.fetch_add(1, Ordering::Relaxed);
        t.scanned.fetch_add(report.scanned, Ordering::Relaxed);
        t.recovered.fetch_add(report.recovered, Ordering::Relaxed);
        t.retried.fetch_add(report.retried, Ordering::Relaxed);
        t.parked.fetch_add(report.parked, Ordering::Relaxed);
        t.deferred.fetch_add(report.deferred, Ordering::Relaxed);
        t.last_tick_ms
            .store(u64::try_from(now.timestamp_millis()).unwrap_or(0), Ordering::Relaxed);
    }

    pub fn totals(&self) -> RecoveryTotals {
        let t = &self.totals;
        let last_tick_ms = t.last_tick_ms.load(Ordering::Relaxed);
        RecoveryTotals {
            ticks: t.ticks.load(Ordering::Relaxed),
            scanned: t.scanned.load(Ordering::Relaxed),
            recovered: t.recovered.load(Ordering::Relaxed),
            retried: t.retried.load(Ordering::Relaxed),
            parked: t.parked.load(Ordering::Relaxed),
            deferred: t.deferred.load(Ordering::Relaxed),
            last_tick_at: (last_tick_ms > 0)
                .then(|| DateTime::from_timestamp_millis(last_tick_ms as i64))
                .flatten(),
        }
    }

    /// Tick on a fixed interval until `shutdown` flips to true or its sender
    /// is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_retries = self.config.retry.max_retries,
            "Recovery engine started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Recovery tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Recovery engine stopping");
                        break;
                    }
                }
            }
        }
    }
}
