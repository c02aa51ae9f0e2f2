use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod error;
pub mod health;
pub mod meals;
pub mod monitoring;

/// Headroom over the encoded image for JSON framing and the filename.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Largest request body that can still carry an image under `max_image_bytes`
/// once base64 encoded.
pub fn body_limit(max_image_bytes: usize) -> usize {
    max_image_bytes
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(BODY_OVERHEAD_BYTES)
}

/// API routes. `/metrics` is mounted separately by the server binary since it
/// needs the recorder handle.
pub fn router(state: AppState) -> Router {
    let limit = body_limit(state.analysis.validator().max_bytes());
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/meals/analyze", post(meals::analyze_meal))
        .route("/api/v1/meals/{id}", get(meals::get_meal))
        .route("/api/v1/uploads/validate", post(meals::validate_upload))
        .route(
            "/api/v1/monitoring/recovery",
            get(monitoring::recovery_stats),
        )
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_limit_covers_base64_inflation() {
        assert_eq!(body_limit(3), 4 + BODY_OVERHEAD_BYTES);
        assert_eq!(body_limit(10 * 1024 * 1024), 13_981_016 + BODY_OVERHEAD_BYTES);
        assert_eq!(body_limit(usize::MAX), usize::MAX);
    }
}
