use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::services::analysis::AnalysisError;
use crate::services::image_validation::ValidationError;
use crate::services::rate_limit::AdmissionDecision;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    pub code: &'static str,
    pub status_code: u16,
}

/// Rate-limit details echoed back in response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
}

impl RateLimitInfo {
    pub fn new(decision: &AdmissionDecision, now: DateTime<Utc>) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            retry_after_secs: decision.retry_after_secs(now),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded. Try again in {} seconds", .0.retry_after_secs)]
    RateLimited(RateLimitInfo),

    #[error("{0} not found")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(e) => e.code(),
            ApiError::InvalidRequest(_) => "INVALID_REQUEST",
            ApiError::RateLimited(_) => "RATE_LIMIT_EXCEEDED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Map a pipeline failure, using `now` to compute `Retry-After`.
    pub fn from_analysis(err: AnalysisError, now: DateTime<Utc>) -> Self {
        match err {
            AnalysisError::Validation(e) => ApiError::Validation(e),
            AnalysisError::Compression(e) => {
                tracing::info!(error = %e, "Rejecting image that could not be decoded");
                ApiError::Validation(ValidationError::InvalidDataFormat)
            }
            AnalysisError::RateLimited { decision, .. } => {
                ApiError::RateLimited(RateLimitInfo::new(&decision, now))
            }
            e @ (AnalysisError::Repository(_) | AnalysisError::Internal(_)) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                message,
                code: self.code(),
                status_code: status.as_u16(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited(info) = &self {
            let headers = response.headers_mut();
            let pairs = [
                ("retry-after", info.retry_after_secs.to_string()),
                ("x-ratelimit-limit", info.limit.to_string()),
                ("x-ratelimit-remaining", info.remaining.to_string()),
                ("x-ratelimit-reset", info.reset_at.timestamp().to_string()),
            ];
            for (name, value) in pairs {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.insert(HeaderName::from_static(name), value);
                }
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rate_limit::CounterBackend;

    #[test]
    fn test_rate_limited_response_headers() {
        let now = Utc::now();
        let decision = AdmissionDecision {
            allowed: false,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(42_500),
            limit: 10,
            backend: CounterBackend::Local,
        };
        let response = ApiError::RateLimited(RateLimitInfo::new(&decision, now)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["retry-after"], "43");
        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_codes_follow_validation_errors() {
        let err = ApiError::from(ValidationError::FileTooLarge { size: 2, max: 1 });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let err = ApiError::Internal("connection refused to 10.0.0.5".to_string());
        assert_eq!(err.code(), "INTERNAL_SERVER_ERROR");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
