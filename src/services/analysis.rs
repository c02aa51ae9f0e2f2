use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::db::{FoodRepository, RepositoryError};
use crate::models::analysis::{CompressionSummary, ValidateUploadResponse};
use crate::models::food::{FoodRecord, FoodStatus};
use crate::models::ingredient::normalize_ingredients;
use crate::services::clock::{add_duration, Clock};
use crate::services::compression::{compress, CompressionError, DEFAULT_COMPRESSION_TARGET_BYTES};
use crate::services::health_monitor::HealthMonitor;
use crate::services::image_validation::{to_data_uri, ImageValidator, ValidationError};
use crate::services::inference::{
    IngredientClassifier, MealVisionAnalyzer, CLASSIFICATION_SERVICE, VISION_SERVICE,
};
use crate::services::rate_limit::{AdmissionDecision, RateLimiter, TrafficClass};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub compression_target_bytes: usize,
    /// How long a freshly created record is hidden from recovery while its
    /// vision call is still in flight.
    pub in_flight_grace: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            compression_target_bytes: DEFAULT_COMPRESSION_TARGET_BYTES,
            in_flight_grace: Duration::from_secs(120),
        }
    }
}

/// Result of a successful submission. Warnings describe soft failures the
/// recovery engine will finish later.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub food: FoodRecord,
    pub compression: CompressionSummary,
    pub warnings: Vec<String>,
}

/// Meal photo submission: validate, compress, admit, analyze, classify,
/// persist.
pub struct MealAnalysisService {
    validator: ImageValidator,
    settings: PipelineSettings,
    limiter: Arc<RateLimiter>,
    monitor: Arc<HealthMonitor>,
    repo: Arc<dyn FoodRepository>,
    vision: Arc<dyn MealVisionAnalyzer>,
    classifier: Arc<dyn IngredientClassifier>,
    clock: Arc<dyn Clock>,
}

impl MealAnalysisService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validator: ImageValidator,
        settings: PipelineSettings,
        limiter: Arc<RateLimiter>,
        monitor: Arc<HealthMonitor>,
        repo: Arc<dyn FoodRepository>,
        vision: Arc<dyn MealVisionAnalyzer>,
        classifier: Arc<dyn IngredientClassifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            validator,
            settings,
            limiter,
            monitor,
            repo,
            vision,
            classifier,
            clock,
        }
    }

    pub fn validator(&self) -> &ImageValidator {
        &self.validator
    }

    /// Run a meal photo through the full pipeline.
    ///
    /// Nothing is persisted and no inference is spent until the image has
    /// passed validation and the caller has vision budget left.
    pub async fn submit(
        &self,
        identifier: &str,
        blob: &str,
        filename: Option<&str>,
    ) -> Result<SubmissionOutcome, AnalysisError> {
        let started = Instant::now();
        let image = self.validator.validate(blob, filename)?;

        let target = self.settings.compression_target_bytes;
        let compressed = if image.size_bytes() <= target {
            compress(&image, target)?
        } else {
            tokio::task::spawn_blocking(move || compress(&image, target))
                .await
                .map_err(|e| AnalysisError::Internal(format!("compression task failed: {e}")))??
        };

        let mut warnings = Vec::new();
        if compressed.compressed_size > target {
            warnings.push(format!(
                "Image could only be reduced to {} bytes (target {target})",
                compressed.compressed_size
            ));
        }

        let decision = self.limiter.admit(identifier, TrafficClass::Vision).await;
        if !decision.allowed {
            metrics::counter!("meal_analyses_total", "outcome" => "rate_limited").increment(1);
            return Err(AnalysisError::RateLimited {
                class: TrafficClass::Vision,
                decision,
            });
        }

        let now = self.clock.now();
        let mut food = FoodRecord::new(identifier, now);
        food.pending_image = Some(to_data_uri(compressed.image.mime, &compressed.image.bytes));
        food.next_eligible_at = Some(add_duration(now, self.settings.in_flight_grace));
        self.repo.create(&food).await?;

        tracing::info!(
            food_id = %food.id,
            identifier,
            original_size = compressed.original_size,
            compressed_size = compressed.compressed_size,
            mime = compressed.image.mime.as_str(),
            "Meal photo accepted for analysis"
        );

        let analysis = match self
            .monitor
            .track(
                VISION_SERVICE,
                self.vision
                    .analyze_meal(&compressed.image.bytes, compressed.image.mime),
            )
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                // Keep the photo and leave the record analyzing for recovery.
                food.next_eligible_at = None;
                food.last_error = Some(e.to_string());
                food.updated_at = self.clock.now();
                self.repo.update(&food).await?;
                metrics::counter!("meal_analyses_total", "outcome" => "vision_deferred").increment(1);
                tracing::warn!(food_id = %food.id, error = %e, "Vision analysis failed; deferring to recovery");
                warnings.push(
                    "Meal analysis is temporarily unavailable and will complete in the background"
                        .to_string(),
                );
                return Ok(SubmissionOutcome {
                    food,
                    compression: compressed.summary(),
                    warnings,
                });
            }
        };

        food.meal_summary = analysis.meal_summary.filter(|s| !s.trim().is_empty());
        food.ingredients = normalize_ingredients(analysis.ingredients);
        food.pending_image = None;

        if food.ingredients.is_empty() {
            warnings.push("No ingredients were detected in the photo".to_string());
        } else if let Some(warning) = self.classify(identifier, &mut food).await {
            warnings.push(warning);
        }

        food.status = FoodStatus::Processed;
        food.next_eligible_at = None;
        food.updated_at = self.clock.now();
        self.repo.update(&food).await?;

        let outcome = if food.has_unzoned() { "partial" } else { "processed" };
        metrics::counter!("meal_analyses_total", "outcome" => outcome).increment(1);
        metrics::histogram!("meal_analysis_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            food_id = %food.id,
            ingredients = food.ingredients.len(),
            unzoned = food.unzoned_names().len(),
            warnings = warnings.len(),
            "Meal analysis complete"
        );

        Ok(SubmissionOutcome {
            food,
            compression: compressed.summary(),
            warnings,
        })
    }

    /// Zone what the classifier can. Returns a warning instead of an error;
    /// anything left unzoned is picked up by recovery.
    async fn classify(&self, identifier: &str, food: &mut FoodRecord) -> Option<String> {
        let decision = self
            .limiter
            .admit(identifier, TrafficClass::Classification)
            .await;
        if !decision.allowed {
            tracing::info!(
                food_id = %food.id,
                identifier,
                "Classification budget spent; leaving ingredients for recovery"
            );
            return Some(
                "Ingredient zoning is delayed by rate limiting and will complete in the background"
                    .to_string(),
            );
        }

        let names = food.unzoned_names();
        match self
            .monitor
            .track(CLASSIFICATION_SERVICE, self.classifier.classify(&names))
            .await
        {
            Ok(assignments) => {
                food.apply_zones(&assignments);
                let remaining = food.unzoned_names().len();
                (remaining > 0).then(|| {
                    format!("{remaining} ingredient(s) could not be zoned yet; retrying in the background")
                })
            }
            Err(e) => {
                tracing::warn!(food_id = %food.id, error = %e, "Classification failed; deferring to recovery");
                food.last_error = Some(e.to_string());
                Some(
                    "Ingredient zoning is temporarily unavailable and will complete in the background"
                        .to_string(),
                )
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<FoodRecord>, AnalysisError> {
        Ok(self.repo.get(id).await?)
    }

    /// Validate an upload without spending inference budget.
    pub fn validate_upload(
        &self,
        blob: &str,
        filename: Option<&str>,
    ) -> Result<ValidateUploadResponse, ValidationError> {
        let image = self.validator.validate(blob, filename)?;
        Ok(ValidateUploadResponse {
            valid: true,
            mime_type: image.mime.as_str().to_string(),
            size_bytes: image.size_bytes(),
            needs_compression: image.size_bytes() > self.settings.compression_target_bytes,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Image could not be processed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Rate limit exceeded for {class} requests")]
    RateLimited {
        class: TrafficClass,
        decision: AdmissionDecision,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}
