use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::Mutex;

use crate::services::clock::{add_duration, Clock};
use crate::services::counter_store::{CounterStore, StoreOutcome, WindowState};

/// Request classes with independently configured budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrafficClass {
    /// Photo analysis; expensive, strict limit.
    Vision,
    /// Ingredient zoning; cheap text call, looser limit.
    Classification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl ClassLimit {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub vision: ClassLimit,
    pub classification: ClassLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            vision: ClassLimit::per_minute(10),
            classification: ClassLimit::per_minute(60),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, class: TrafficClass) -> ClassLimit {
        match class {
            TrafficClass::Vision => self.vision,
            TrafficClass::Classification => self.classification,
        }
    }
}

/// Which counter answered an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CounterBackend {
    Shared,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub limit: u32,
    pub backend: CounterBackend,
}

impl AdmissionDecision {
    fn from_window(window: WindowState, limit: u32, backend: CounterBackend) -> Self {
        Self {
            allowed: window.allowed,
            remaining: limit.saturating_sub(window.count),
            reset_at: window.reset_at,
            limit,
            backend,
        }
    }

    /// Whole seconds until the window resets, never less than one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Admission controller for calls to the inference service.
///
/// The shared store is consulted first so limits hold across instances. When
/// it cannot be reached the same limits are enforced from an in-process map;
/// that loses cross-instance consistency but never admits more than `limit`
/// per window on this instance.
pub struct RateLimiter {
    config: RateLimitConfig,
    shared: Option<Arc<dyn CounterStore>>,
    local: Mutex<HashMap<String, LocalWindow>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        shared: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            shared,
            local: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Decide whether `identifier` may make one more `class` call.
    pub async fn admit(&self, identifier: &str, class: TrafficClass) -> AdmissionDecision {
        let limit = self.config.limit_for(class);
        let key = format!("{class}:{identifier}");
        let now = self.clock.now();

        let decision = match self.shared_hit(&key, limit, now).await {
            Some(window) => {
                AdmissionDecision::from_window(window, limit.max_requests, CounterBackend::Shared)
            }
            None => {
                let window = self.local_hit(&key, limit, now).await;
                AdmissionDecision::from_window(window, limit.max_requests, CounterBackend::Local)
            }
        };

        record_decision(&class.to_string(), &decision);
        if !decision.allowed {
            tracing::info!(
                identifier,
                class = %class,
                limit = decision.limit,
                reset_at = %decision.reset_at,
                backend = %decision.backend,
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// Admission for callers outside the named classes, e.g. upload checks.
    /// Always served by the in-process counter.
    pub async fn admit_custom(
        &self,
        identifier: &str,
        scope: &str,
        max_requests: u32,
        window: Duration,
    ) -> AdmissionDecision {
        let limit = ClassLimit {
            max_requests,
            window,
        };
        let key = format!("custom:{scope}:{identifier}");
        let window = self.local_hit(&key, limit, self.clock.now()).await;
        let decision = AdmissionDecision::from_window(window, max_requests, CounterBackend::Local);
        record_decision(scope, &decision);
        decision
    }

    async fn shared_hit(
        &self,
        key: &str,
        limit: ClassLimit,
        now: DateTime<Utc>,
    ) -> Option<WindowState> {
        let store = self.shared.as_ref()?;
        match store.hit(key, limit.max_requests, limit.window, now).await {
            StoreOutcome::Counted(window) => Some(window),
            StoreOutcome::Unavailable(reason) => {
                metrics::counter!("rate_limit_store_fallbacks_total", "store" => store.name())
                    .increment(1);
                tracing::warn!(
                    store = store.name(),
                    key,
                    reason = %reason,
                    "Shared rate-limit store unavailable, using in-process counter"
                );
                None
            }
        }
    }

    async fn local_hit(&self, key: &str, limit: ClassLimit, now: DateTime<Utc>) -> WindowState {
        let mut windows = self.local.lock().await;
        let fresh = LocalWindow {
            count: 0,
            reset_at: add_duration(now, limit.window),
        };
        let entry = windows.entry(key.to_string()).or_insert(fresh);
        if now >= entry.reset_at {
            *entry = fresh;
        }

        if entry.count >= limit.max_requests {
            return WindowState {
                allowed: false,
                count: entry.count,
                reset_at: entry.reset_at,
            };
        }
        entry.count += 1;
        WindowState {
            allowed: true,
            count: entry.count,
            reset_at: entry.reset_at,
        }
    }

    /// Drop in-process windows that have already reset. Returns how many.
    pub async fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.local.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now < w.reset_at);
        before - windows.len()
    }

    pub async fn tracked_windows(&self) -> usize {
        self.local.lock().await.len()
    }
}

fn record_decision(class: &str, decision: &AdmissionDecision) {
    let outcome = if decision.allowed { "allowed" } else { "rejected" };
    metrics::counter!(
        "rate_limit_decisions_total",
        "class" => class.to_string(),
        "outcome" => outcome,
        "backend" => decision.backend.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::counter_store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DownStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn hit(&self, _: &str, _: u32, _: Duration, _: DateTime<Utc>) -> StoreOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StoreOutcome::Unavailable("connection refused".to_string())
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(1)))
        }
    }

    fn limiter(vision: u32, clock: Arc<ManualClock>) -> RateLimiter {
        let config = RateLimitConfig {
            vision: ClassLimit::per_minute(vision),
            classification: ClassLimit::per_minute(vision * 6),
        };
        RateLimiter::new(config, None, clock)
    }

    #[tokio::test]
    async fn test_limit_then_reject_then_reset() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(3, clock.clone());

        for expected_remaining in [2, 1, 0] {
            let d = limiter.admit("alice", TrafficClass::Vision).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
            assert_eq!(d.limit, 3);
            assert_eq!(d.backend, CounterBackend::Local);
        }

        let rejected = limiter.admit("alice", TrafficClass::Vision).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);

        clock.advance(Duration::from_secs(60));
        let after_reset = limiter.admit("alice", TrafficClass::Vision).await;
        assert!(after_reset.allowed);
        assert_eq!(after_reset.remaining, 2);
    }

    #[tokio::test]
    async fn test_rejections_do_not_extend_window() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(1, clock.clone());

        let first = limiter.admit("bob", TrafficClass::Vision).await;
        for _ in 0..5 {
            clock.advance(Duration::from_secs(5));
            let d = limiter.admit("bob", TrafficClass::Vision).await;
            assert!(!d.allowed);
            assert_eq!(d.reset_at, first.reset_at);
        }
    }

    #[tokio::test]
    async fn test_classes_and_identifiers_are_independent() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(1, clock);

        assert!(limiter.admit("alice", TrafficClass::Vision).await.allowed);
        assert!(!limiter.admit("alice", TrafficClass::Vision).await.allowed);
        assert!(limiter.admit("alice", TrafficClass::Classification).await.allowed);
        assert!(limiter.admit("carol", TrafficClass::Vision).await.allowed);
    }

    #[tokio::test]
    async fn test_unreachable_store_falls_back_with_same_limit() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(DownStore {
            calls: AtomicUsize::new(0),
        });
        let limiter = RateLimiter::new(
            RateLimitConfig {
                vision: ClassLimit::per_minute(2),
                classification: ClassLimit::per_minute(10),
            },
            Some(store.clone()),
            clock,
        );

        let results: Vec<bool> = futures::future::join_all(
            (0..6).map(|_| limiter.admit("dave", TrafficClass::Vision)),
        )
        .await
        .into_iter()
        .map(|d| {
            assert_eq!(d.backend, CounterBackend::Local);
            d.allowed
        })
        .collect();

        assert_eq!(results.iter().filter(|a| **a).count(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_custom_admission_uses_local_counter() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(10, clock.clone());

        let window = Duration::from_secs(30);
        assert!(limiter.admit_custom("erin", "uploads", 1, window).await.allowed);
        let d = limiter.admit_custom("erin", "uploads", 1, window).await;
        assert!(!d.allowed);
        assert_eq!(d.retry_after_secs(clock.now()), 30);

        // Named classes are unaffected by the custom scope.
        assert!(limiter.admit("erin", TrafficClass::Vision).await.allowed);
    }

    #[tokio::test]
    async fn test_prune_expired_windows() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(5, clock.clone());
        limiter.admit("a", TrafficClass::Vision).await;
        limiter.admit("b", TrafficClass::Vision).await;
        assert_eq!(limiter.tracked_windows().await, 2);

        assert_eq!(limiter.prune_expired().await, 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.prune_expired().await, 2);
        assert_eq!(limiter.tracked_windows().await, 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let decision = AdmissionDecision {
            allowed: false,
            remaining: 0,
            reset_at: now + chrono::Duration::milliseconds(1500),
            limit: 10,
            backend: CounterBackend::Local,
        };
        assert_eq!(decision.retry_after_secs(now), 2);
        assert_eq!(decision.retry_after_secs(now + chrono::Duration::seconds(5)), 1);
    }
}
