//! Latency, success and error tracking for calls to the inference service,
//! plus the 0–100 health score derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display as StrumDisplay;
use tokio::sync::Mutex;

use crate::services::clock::Clock;

const MAX_SIGNATURE_CHARS: usize = 120;
const TOP_ERRORS_REPORTED: usize = 5;

/// Thresholds for alerts and score penalties.
///
/// The defaults are operating policy, not derived from an SLO; deployments
/// tune them through configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// Span considered "recent" for failure rates and log retention.
    pub recent_window: Duration,
    /// Upper bound on rolling log entries kept per service.
    pub max_log_entries: usize,

    /// A single call slower than this is logged as a warning.
    pub slow_call_ms: u64,
    /// Recent failure rate that triggers a warning log.
    pub alert_failure_rate: f64,
    pub alert_min_samples: usize,

    /// Success rate (percent) below which the score is penalised.
    pub min_success_rate: f64,
    pub success_rate_min_samples: u64,
    pub success_rate_penalty: u32,

    pub high_latency_ms: f64,
    pub high_latency_penalty: u32,
    pub elevated_latency_ms: f64,
    pub elevated_latency_penalty: u32,

    pub recent_failure_rate: f64,
    pub recent_failure_min_samples: usize,
    pub recent_failure_penalty: u32,

    /// Share of all calls one error signature may reach before it is "dominant".
    pub dominant_error_share: f64,
    pub dominant_error_penalty: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            recent_window: Duration::from_secs(3600),
            max_log_entries: 1000,
            slow_call_ms: 8_000,
            alert_failure_rate: 0.20,
            alert_min_samples: 10,
            min_success_rate: 95.0,
            success_rate_min_samples: 10,
            success_rate_penalty: 20,
            high_latency_ms: 10_000.0,
            high_latency_penalty: 20,
            elevated_latency_ms: 5_000.0,
            elevated_latency_penalty: 10,
            recent_failure_rate: 0.10,
            recent_failure_min_samples: 5,
            recent_failure_penalty: 30,
            dominant_error_share: 0.10,
            dominant_error_penalty: 15,
        }
    }
}

/// Handle returned by [`HealthMonitor::start_request`].
#[derive(Debug)]
#[must_use = "pass the token to end_request to record the outcome"]
pub struct RequestToken {
    service: String,
    started_at: DateTime<Utc>,
}

/// Outcome of one call.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Measured duration; derived from the token's start time when absent.
    pub duration_ms: Option<u64>,
}

impl RequestOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration_ms: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestLogEntry {
    at: DateTime<Utc>,
    success: bool,
    duration_ms: u64,
}

#[derive(Debug, Default)]
struct ServiceStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    total_duration_ms: u64,
    log: VecDeque<RequestLogEntry>,
    error_counts: HashMap<String, u64>,
    last_request_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ServiceStats {
    /// Request count, failure count and summed duration since `since`.
    fn recent(&self, since: DateTime<Utc>) -> (usize, usize, u64) {
        self.log
            .iter()
            .filter(|e| e.at >= since)
            .fold((0, 0, 0), |(total, failed, duration), e| {
                (
                    total + 1,
                    failed + usize::from(!e.success),
                    duration.saturating_add(e.duration_ms),
                )
            })
    }

    fn summary(&self, since: DateTime<Utc>) -> ServiceSummary {
        let (recent_requests, recent_failures, recent_duration_ms) = self.recent(since);
        let mut top_errors: Vec<ErrorCount> = self
            .error_counts
            .iter()
            .map(|(signature, count)| ErrorCount {
                signature: signature.clone(),
                count: *count,
            })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.signature.cmp(&b.signature)));
        top_errors.truncate(TOP_ERRORS_REPORTED);

        ServiceSummary {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate: percent(self.successful_requests, self.total_requests),
            average_duration_ms: if self.total_requests == 0 {
                0.0
            } else {
                self.total_duration_ms as f64 / self.total_requests as f64
            },
            recent_requests,
            recent_failures,
            recent_failure_rate: ratio(recent_failures, recent_requests),
            recent_average_duration_ms: if recent_requests == 0 {
                0.0
            } else {
                recent_duration_ms as f64 / recent_requests as f64
            },
            top_errors,
            last_request_at: self.last_request_at,
            last_error: self.last_error.clone(),
        }
    }

    fn prune(&mut self, cutoff: DateTime<Utc>, max_entries: usize) -> usize {
        let before = self.log.len();
        while self.log.front().is_some_and(|e| e.at < cutoff) {
            self.log.pop_front();
        }
        while self.log.len() > max_entries {
            self.log.pop_front();
        }
        before - self.log.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub signature: String,
    pub count: u64,
}

/// Point-in-time statistics for one external service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percent, 0–100. 100 when nothing has been recorded.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub recent_requests: usize,
    pub recent_failures: usize,
    /// Fraction, 0–1. 0 when nothing recent has been recorded.
    pub recent_failure_rate: f64,
    /// Mean latency over the recent window only.
    pub recent_average_duration_ms: f64,
    pub top_errors: Vec<ErrorCount>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Records outcomes of inference calls per service.
pub struct HealthMonitor {
    policy: HealthPolicy,
    clock: Arc<dyn Clock>,
    services: Mutex<HashMap<String, ServiceStats>>,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Make a service visible in summaries before its first call.
    pub async fn register_service(&self, service: &str) {
        self.services
            .lock()
            .await
            .entry(service.to_string())
            .or_default();
    }

    pub fn start_request(&self, service: &str) -> RequestToken {
        RequestToken {
            service: service.to_string(),
            started_at: self.clock.now(),
        }
    }

    pub async fn end_request(&self, token: RequestToken, outcome: RequestOutcome) {
        let now = self.clock.now();
        let duration_ms = outcome.duration_ms.unwrap_or_else(|| {
            (now - token.started_at).num_milliseconds().max(0) as u64
        });
        let since = self.recent_cutoff(now);

        let (recent_requests, recent_failures) = {
            let mut services = self.services.lock().await;
            let stats = services.entry(token.service.clone()).or_default();

            stats.total_requests += 1;
            stats.total_duration_ms = stats.total_duration_ms.saturating_add(duration_ms);
            stats.last_request_at = Some(now);
            if outcome.success {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
                let message = outcome.error.as_deref().unwrap_or("unknown error");
                *stats
                    .error_counts
                    .entry(error_signature(message))
                    .or_insert(0) += 1;
                stats.last_error = Some(message.to_string());
            }

            stats.log.push_back(RequestLogEntry {
                at: now,
                success: outcome.success,
                duration_ms,
            });
            if stats.log.len() > self.policy.max_log_entries {
                stats.log.pop_front();
            }

            let (requests, failures, _) = stats.recent(since);
            (requests, failures)
        };

        let status = if outcome.success { "success" } else { "failure" };
        metrics::counter!(
            "inference_requests_total",
            "service" => token.service.clone(),
            "status" => status
        )
        .increment(1);
        metrics::histogram!(
            "inference_request_duration_seconds",
            "service" => token.service.clone()
        )
        .record(duration_ms as f64 / 1000.0);

        if duration_ms > self.policy.slow_call_ms {
            tracing::warn!(
                service = %token.service,
                duration_ms,
                threshold_ms = self.policy.slow_call_ms,
                "Slow inference call"
            );
        }

        let recent_failure_rate = ratio(recent_failures, recent_requests);
        if recent_requests >= self.policy.alert_min_samples
            && recent_failure_rate > self.policy.alert_failure_rate
        {
            tracing::warn!(
                service = %token.service,
                recent_requests,
                recent_failures,
                recent_failure_rate,
                "High recent failure rate for inference service"
            );
        }
    }

    /// Run `call` between `start_request` and `end_request`.
    pub async fn track<T, E, F>(&self, service: &str, call: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let token = self.start_request(service);
        let started = std::time::Instant::now();
        let result = call.await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let outcome = match &result {
            Ok(_) => RequestOutcome::success(),
            Err(e) => RequestOutcome::failure(e.to_string()),
        };
        self.end_request(token, outcome.with_duration_ms(elapsed_ms)).await;
        result
    }

    pub async fn health_summary(&self) -> BTreeMap<String, ServiceSummary> {
        let since = self.recent_cutoff(self.clock.now());
        self.services
            .lock()
            .await
            .iter()
            .map(|(name, stats)| (name.clone(), stats.summary(since)))
            .collect()
    }

    pub async fn service_summary(&self, service: &str) -> Option<ServiceSummary> {
        let since = self.recent_cutoff(self.clock.now());
        self.services
            .lock()
            .await
            .get(service)
            .map(|stats| stats.summary(since))
    }

    /// Drop log entries older than the recent window and cap log length.
    /// Returns how many entries were removed.
    pub async fn cleanup(&self) -> usize {
        let cutoff = self.recent_cutoff(self.clock.now());
        let mut services = self.services.lock().await;
        let removed: usize = services
            .values_mut()
            .map(|stats| stats.prune(cutoff, self.policy.max_log_entries))
            .sum();
        if removed > 0 {
            tracing::debug!(removed, "Pruned health monitor request log");
        }
        removed
    }

    fn recent_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.policy.recent_window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Group similar error messages: lowercased, digit runs collapsed to `#`,
/// truncated. `"timeout after 1500ms"` and `"Timeout after 30000ms"` share a
/// signature.
pub fn error_signature(message: &str) -> String {
    let mut signature = String::new();
    let mut in_digits = false;
    for ch in message.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_digit() {
            if !in_digits {
                signature.push('#');
            }
            in_digits = true;
        } else {
            signature.push(ch);
            in_digits = false;
        }
    }
    signature.chars().take(MAX_SIGNATURE_CHARS).collect()
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

// ============================================================================
// Health score
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Error,
}

impl HealthStatus {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Self::Healthy,
            70..=89 => Self::Degraded,
            50..=69 => Self::Unhealthy,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceAssessment {
    pub service: String,
    pub score: u32,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Overall health across every tracked service. The worst service sets the
/// overall score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub score: u32,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub services: Vec<ServiceAssessment>,
}

pub fn assess_service(
    service: &str,
    summary: &ServiceSummary,
    policy: &HealthPolicy,
) -> ServiceAssessment {
    let mut score: i64 = 100;
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    if summary.total_requests == 0 {
        issues.push(format!("{service}: no recorded usage"));
        return ServiceAssessment {
            service: service.to_string(),
            score: 100,
            status: HealthStatus::Healthy,
            issues,
            recommendations,
        };
    }

    if summary.total_requests >= policy.success_rate_min_samples
        && summary.success_rate < policy.min_success_rate
    {
        score -= i64::from(policy.success_rate_penalty);
        issues.push(format!(
            "{service}: success rate {:.1}% is below {:.0}%",
            summary.success_rate, policy.min_success_rate
        ));
        recommendations.push(format!(
            "Check {service} error logs and upstream status for recurring failures"
        ));
    }

    if summary.average_duration_ms > policy.high_latency_ms {
        score -= i64::from(policy.high_latency_penalty);
        issues.push(format!(
            "{service}: average latency {:.0}ms is very high",
            summary.average_duration_ms
        ));
        recommendations.push("Reduce image sizes or lower the compression target".to_string());
    } else if summary.average_duration_ms > policy.elevated_latency_ms {
        score -= i64::from(policy.elevated_latency_penalty);
        issues.push(format!(
            "{service}: average latency {:.0}ms is elevated",
            summary.average_duration_ms
        ));
        recommendations.push(format!("Monitor {service} latency trend"));
    }

    if summary.recent_requests >= policy.recent_failure_min_samples
        && summary.recent_failure_rate > policy.recent_failure_rate
    {
        score -= i64::from(policy.recent_failure_penalty);
        issues.push(format!(
            "{service}: {:.0}% of calls failed in the last hour",
            summary.recent_failure_rate * 100.0
        ));
        recommendations.push(
            "Consider lowering vision rate limits until the service recovers".to_string(),
        );
    }

    if let Some(top) = summary.top_errors.first() {
        let share = top.count as f64 / summary.total_requests as f64;
        if share > policy.dominant_error_share {
            score -= i64::from(policy.dominant_error_penalty);
            issues.push(format!(
                "{service}: recurring error '{}' ({} occurrences)",
                top.signature, top.count
            ));
            recommendations.push(format!("Investigate the most common {service} error"));
        }
    }

    let score = score.clamp(0, 100) as u32;
    ServiceAssessment {
        service: service.to_string(),
        score,
        status: HealthStatus::from_score(score),
        issues,
        recommendations,
    }
}

pub fn assess_all(
    summaries: &BTreeMap<String, ServiceSummary>,
    policy: &HealthPolicy,
) -> HealthReport {
    let services: Vec<ServiceAssessment> = summaries
        .iter()
        .map(|(name, summary)| assess_service(name, summary, policy))
        .collect();

    let score = services.iter().map(|s| s.score).min().unwrap_or(100);
    let mut issues: Vec<String> = services.iter().flat_map(|s| s.issues.clone()).collect();
    if services.is_empty() {
        issues.push("no recorded usage".to_string());
    }
    let mut recommendations: Vec<String> = Vec::new();
    for rec in services.iter().flat_map(|s| s.recommendations.iter()) {
        if !recommendations.contains(rec) {
            recommendations.push(rec.clone());
        }
    }

    HealthReport {
        status: HealthStatus::from_score(score),
        score,
        issues,
        recommendations,
        services,
    }
}
