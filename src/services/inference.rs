use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::models::analysis::MealAnalysis;
use crate::models::ingredient::{Zone, ZoneAssignment};
use crate::services::image_validation::ImageMime;

/// Service names used for health tracking and metrics labels.
pub const VISION_SERVICE: &str = "vision";
pub const CLASSIFICATION_SERVICE: &str = "classification";

pub const DEFAULT_VISION_MODEL: &str = "@cf/meta/llama-3.2-11b-vision-instruct";
pub const DEFAULT_CLASSIFICATION_MODEL: &str = "@cf/meta/llama-3.1-8b-instruct";

const VISION_PROMPT: &str = concat!(
    "Identify the meal in this photo and list every visible ingredient. ",
    "Return ONLY valid JSON of the form ",
    r#"{"mealSummary": string, "ingredients": [{"name": string, "organic": boolean, "category": string}]}. "#,
    "Use short lowercase ingredient names."
);

const CLASSIFICATION_PROMPT: &str = concat!(
    "Classify each ingredient for a gut-health elimination diet as green (safe), ",
    "yellow (moderate) or red (avoid). Return ONLY a JSON array of ",
    r#"{"name": string, "zone": "green" | "yellow" | "red"} with one entry per ingredient. "#,
    "Ingredients: "
);

/// Extracts a meal summary and raw ingredient list from a photo.
#[async_trait]
pub trait MealVisionAnalyzer: Send + Sync {
    async fn analyze_meal(&self, image: &[u8], mime: ImageMime)
        -> Result<MealAnalysis, InferenceError>;
}

/// Assigns a zone to each ingredient name.
#[async_trait]
pub trait IngredientClassifier: Send + Sync {
    async fn classify(&self, ingredients: &[String]) -> Result<Vec<ZoneAssignment>, InferenceError>;
}

/// Client for Cloudflare Workers AI text and vision models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
    vision_model: String,
    classification_model: String,
}

#[derive(Deserialize)]
struct WorkersAiEnvelope {
    #[serde(default)]
    result: Option<WorkersAiResult>,
    #[serde(default)]
    errors: Vec<WorkersAiMessage>,
}

#[derive(Deserialize)]
struct WorkersAiResult {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct WorkersAiMessage {
    #[serde(default)]
    message: String,
}

/// Zone as the model wrote it, before case-insensitive parsing.
#[derive(Deserialize)]
struct RawZoneAssignment {
    name: String,
    #[serde(default)]
    zone: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClassificationPayload {
    List(Vec<RawZoneAssignment>),
    Wrapped { ingredients: Vec<RawZoneAssignment> },
}

impl WorkersAiClient {
    pub fn new(
        account_id: String,
        api_token: String,
        vision_model: String,
        classification_model: String,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(InferenceError::Http)?;
        Ok(Self {
            http,
            account_id,
            api_token,
            vision_model,
            classification_model,
        })
    }

    async fn run_model(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<String, InferenceError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(InferenceError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        let envelope: WorkersAiEnvelope = response.json().await.map_err(InferenceError::Http)?;
        envelope_text(envelope)
    }
}

#[async_trait]
impl MealVisionAnalyzer for WorkersAiClient {
    async fn analyze_meal(
        &self,
        image: &[u8],
        mime: ImageMime,
    ) -> Result<MealAnalysis, InferenceError> {
        let body = serde_json::json!({
            "image": format!(
                "data:{};base64,{}",
                mime.as_str(),
                base64::engine::general_purpose::STANDARD.encode(image)
            ),
            "prompt": VISION_PROMPT,
            "max_tokens": 1024
        });
        let text = self.run_model(&self.vision_model, body).await?;
        parse_meal_analysis(&text)
    }
}

#[async_trait]
impl IngredientClassifier for WorkersAiClient {
    async fn classify(&self, ingredients: &[String]) -> Result<Vec<ZoneAssignment>, InferenceError> {
        if ingredients.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "messages": [
                { "role": "user", "content": format!("{CLASSIFICATION_PROMPT}{}", ingredients.join(", ")) }
            ],
            "max_tokens": 1024
        });
        let text = self.run_model(&self.classification_model, body).await?;
        parse_zone_assignments(&text)
    }
}

fn envelope_text(envelope: WorkersAiEnvelope) -> Result<String, InferenceError> {
    let text = envelope
        .result
        .and_then(|r| r.response.or(r.description))
        .filter(|t| !t.trim().is_empty());
    match text {
        Some(text) => Ok(text),
        None => match envelope.errors.into_iter().next() {
            Some(e) if !e.message.is_empty() => Err(InferenceError::Status {
                status: 200,
                message: e.message,
            }),
            _ => Err(InferenceError::EmptyResponse),
        },
    }
}

/// Pull the JSON document out of model output that may wrap it in prose or a
/// fenced code block.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_meal_analysis(text: &str) -> Result<MealAnalysis, InferenceError> {
    let json = extract_json(text).ok_or(InferenceError::EmptyResponse)?;
    serde_json::from_str(json).map_err(InferenceError::Parse)
}

/// Unknown or missing zones come back as `unzoned`.
pub fn parse_zone_assignments(text: &str) -> Result<Vec<ZoneAssignment>, InferenceError> {
    let json = extract_json(text).ok_or(InferenceError::EmptyResponse)?;
    let raw = match serde_json::from_str(json).map_err(InferenceError::Parse)? {
        ClassificationPayload::List(items) => items,
        ClassificationPayload::Wrapped { ingredients } => ingredients,
    };
    Ok(raw
        .into_iter()
        .map(|r| ZoneAssignment {
            zone: Zone::from_str(r.zone.trim()).unwrap_or(Zone::Unzoned),
            name: r.name,
        })
        .collect())
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Inference service returned an empty response")]
    EmptyResponse,

    #[error("Failed to parse model output: {0}")]
    Parse(#[from] serde_json::Error),
}
