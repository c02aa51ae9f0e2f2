use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

use crate::app_state::AppState;
use crate::db::RecoveryCounts;
use crate::routes::error::ApiError;
use crate::services::recovery::RecoveryTotals;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatsResponse {
    pub enabled: bool,
    pub records: RecoveryCounts,
    pub engine: RecoveryTotals,
    pub max_retries: u32,
    pub batch_size: usize,
    pub scan_interval_secs: u64,
}

/// GET /api/v1/monitoring/recovery: records awaiting recovery and engine counters.
pub async fn recovery_stats(
    State(state): State<AppState>,
) -> Result<Json<RecoveryStatsResponse>, ApiError> {
    let records = state
        .repo
        .recovery_counts(state.clock.now())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let config = state.recovery.config();

    metrics::gauge!("recovery_pending_review_records").set(records.pending_review as f64);

    Ok(Json(RecoveryStatsResponse {
        enabled: state.recovery_enabled,
        records,
        engine: state.recovery.totals(),
        max_retries: config.retry.max_retries,
        batch_size: config.batch_size,
        scan_interval_secs: config.scan_interval.as_secs(),
    }))
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(
    State(handle): State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}
