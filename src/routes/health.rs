use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::app_state::AppState;
use crate::services::health_monitor::{assess_all, HealthStatus, ServiceAssessment, ServiceSummary};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub score: u32,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub services: BTreeMap<String, ServiceSummary>,
    pub assessments: Vec<ServiceAssessment>,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub counter_store: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub backend: &'static str,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn ok(backend: &'static str, started: Instant) -> Self {
        Self {
            status: "ok".to_string(),
            backend,
            latency_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
        }
    }

    fn error(backend: &'static str, error: String) -> Self {
        Self {
            status: "error".to_string(),
            backend,
            latency_ms: None,
            error: Some(error),
        }
    }

    fn is_ok(&self) -> bool {
        self.status != "error"
    }
}

/// GET /health: inference health score plus dependency status.
///
/// Responds 503 when the overall status is `error`.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let summaries = state.monitor.health_summary().await;
    let mut report = assess_all(&summaries, state.monitor.policy());

    // Check database connectivity
    let db_start = Instant::now();
    let database = match state.repo.ping().await {
        Ok(()) => ComponentHealth::ok(state.repo.name(), db_start),
        Err(e) => ComponentHealth::error(state.repo.name(), e.to_string()),
    };
    if !database.is_ok() {
        report.status = HealthStatus::Error;
        report.issues.push("database: unreachable".to_string());
        report
            .recommendations
            .push("Check database connectivity and credentials".to_string());
    }

    // Check shared counter store; losing it only degrades rate limiting
    let counter_store = match &state.counter_store {
        Some(store) => {
            let store_start = Instant::now();
            match store.health_check().await {
                Ok(()) => ComponentHealth::ok(store.name(), store_start),
                Err(e) => ComponentHealth::error(store.name(), e.to_string()),
            }
        }
        None => ComponentHealth {
            status: "not_configured".to_string(),
            backend: "local",
            latency_ms: None,
            error: None,
        },
    };
    if !counter_store.is_ok() {
        report.status = report.status.max(HealthStatus::Degraded);
        report
            .issues
            .push("counter_store: unreachable, rate limits enforced per instance".to_string());
        report
            .recommendations
            .push("Restore the shared counter store to keep limits consistent".to_string());
    }

    let status_code = if report.status == HealthStatus::Error {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = HealthResponse {
        status: report.status,
        score: report.score,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: state.clock.now(),
        issues: report.issues,
        recommendations: report.recommendations,
        services: summaries,
        assessments: report.services,
        checks: HealthChecks {
            database,
            counter_store,
        },
    };

    let mut response = (status_code, Json(response)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}
