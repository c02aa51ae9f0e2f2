use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use std::time::Duration;
use uuid::Uuid;

use crate::app_state::{AppState, UPLOAD_CHECKS_PER_MINUTE};
use crate::models::analysis::{
    AnalyzeMealRequest, AnalyzeMealResponse, ValidateUploadRequest, ValidateUploadResponse,
};
use crate::models::food::FoodRecord;
use crate::routes::error::{ApiError, RateLimitInfo};
use crate::services::image_validation::ValidationError;

pub const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS: &str = "anonymous";
const MAX_IDENTIFIER_LEN: usize = 128;

/// Caller identity used for admission budgets.
pub fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(MAX_IDENTIFIER_LEN).collect())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

fn parse_body<T: Validate<Context = ()>>(
    payload: Result<Json<T>, JsonRejection>,
    headers: &HeaderMap,
    max_image_bytes: usize,
) -> Result<T, ApiError> {
    let Json(body) = payload.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            oversized_body(headers, max_image_bytes)
        } else {
            ApiError::InvalidRequest(rejection.body_text())
        }
    })?;
    body.validate()
        .map_err(|report| ApiError::InvalidRequest(report.to_string()))?;
    Ok(body)
}

/// A body over the router limit carries an image over the cap. The declared
/// length gives an estimate of the decoded size when the client sent one.
fn oversized_body(headers: &HeaderMap, max: usize) -> ApiError {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    ApiError::Validation(ValidationError::FileTooLarge {
        size: (declared / 4 * 3).max(max.saturating_add(1)),
        max,
    })
}

/// POST /api/v1/meals/analyze: Analyze a meal photo and zone its ingredients.
pub async fn analyze_meal(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AnalyzeMealRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AnalyzeMealResponse>), ApiError> {
    let request = parse_body(payload, &headers, state.analysis.validator().max_bytes())?;
    let identifier = caller_identity(&headers);

    let outcome = state
        .analysis
        .submit(&identifier, &request.image, request.filename.as_deref())
        .await
        .map_err(|e| ApiError::from_analysis(e, state.clock.now()))?;

    Ok((
        StatusCode::CREATED,
        Json(AnalyzeMealResponse {
            food: outcome.food,
            compression: outcome.compression,
            warnings: outcome.warnings,
        }),
    ))
}

/// GET /api/v1/meals/{id}: Fetch a food record and its zoning progress.
pub async fn get_meal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FoodRecord>, ApiError> {
    let record = state
        .analysis
        .get(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    record
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Food record {id}")))
}

/// POST /api/v1/uploads/validate: Check an image without spending inference.
pub async fn validate_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ValidateUploadRequest>, JsonRejection>,
) -> Result<Json<ValidateUploadResponse>, ApiError> {
    let identifier = caller_identity(&headers);
    let decision = state
        .limiter
        .admit_custom(
            &identifier,
            "upload_validation",
            UPLOAD_CHECKS_PER_MINUTE,
            Duration::from_secs(60),
        )
        .await;
    if !decision.allowed {
        return Err(ApiError::RateLimited(RateLimitInfo::new(
            &decision,
            state.clock.now(),
        )));
    }

    let request = parse_body(payload, &headers, state.analysis.validator().max_bytes())?;
    let response = state
        .analysis
        .validate_upload(&request.image, request.filename.as_deref())?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_identity_defaults_to_anonymous() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_identity(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("   "));
        assert_eq!(caller_identity(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" user-42 "));
        assert_eq!(caller_identity(&headers), "user-42");
    }

    #[test]
    fn test_oversized_body_reports_file_too_large() {
        let mut headers = HeaderMap::new();
        let err = oversized_body(&headers, 1024);
        assert!(matches!(
            err,
            ApiError::Validation(ValidationError::FileTooLarge { size: 1025, max: 1024 })
        ));

        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("400000"));
        let err = oversized_body(&headers, 1024);
        assert!(matches!(
            err,
            ApiError::Validation(ValidationError::FileTooLarge { size: 300_000, max: 1024 })
        ));
    }
}
