use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::food::FoodRecord;
use crate::models::ingredient::ExtractedIngredient;

/// Request to analyze a meal photo.
#[derive(Debug, Deserialize, Validate)]
pub struct AnalyzeMealRequest {
    /// `data:<mime>;base64,<payload>`
    #[garde(length(min = 1))]
    pub image: String,

    #[garde(length(min = 1, max = 255))]
    pub filename: Option<String>,
}

/// Request to check an upload without spending an inference call.
#[derive(Debug, Deserialize, Validate)]
pub struct ValidateUploadRequest {
    #[garde(length(min = 1))]
    pub image: String,

    #[garde(length(min = 1, max = 255))]
    pub filename: Option<String>,
}

/// Structured output of the vision model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealAnalysis {
    #[serde(default, alias = "meal_summary")]
    pub meal_summary: Option<String>,

    #[serde(default)]
    pub ingredients: Vec<ExtractedIngredient>,
}

/// Compression details reported back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSummary {
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    pub quality: f32,
}

/// Response after submitting a meal photo.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeMealResponse {
    pub food: FoodRecord,
    pub compression: CompressionSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Response from the upload validation endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateUploadResponse {
    pub valid: bool,
    pub mime_type: String,
    pub size_bytes: usize,
    pub needs_compression: bool,
}
