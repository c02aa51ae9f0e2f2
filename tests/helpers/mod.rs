//! Test helpers: scripted inference fakes and an in-process app builder
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use meal_zone_guard::app_state::AppState;
use meal_zone_guard::config::AppConfig;
use meal_zone_guard::db::MemoryFoodRepository;
use meal_zone_guard::models::analysis::MealAnalysis;
use meal_zone_guard::models::ingredient::{Zone, ZoneAssignment};
use meal_zone_guard::routes;
use meal_zone_guard::services::clock::ManualClock;
use meal_zone_guard::services::counter_store::{CounterStore, StoreError, StoreOutcome};
use meal_zone_guard::services::image_validation::ImageMime;
use meal_zone_guard::services::inference::{
    IngredientClassifier, InferenceError, MealVisionAnalyzer,
};

use crate::fixtures::curry_analysis;

fn upstream_error(message: &str) -> InferenceError {
    InferenceError::Status {
        status: 503,
        message: message.to_string(),
    }
}

/// Vision fake: pops scripted failures first, then returns `reply`.
pub struct ScriptedVision {
    reply: MealAnalysis,
    failures: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    mimes: Mutex<Vec<ImageMime>>,
    sizes: Mutex<Vec<usize>>,
}

impl ScriptedVision {
    pub fn returning(reply: MealAnalysis) -> Self {
        Self {
            reply,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            mimes: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
        }
    }

    pub async fn fail_next(&self, times: usize) {
        let mut failures = self.failures.lock().await;
        for i in 0..times {
            failures.push_back(format!("vision model overloaded (request {i})"));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn mimes(&self) -> Vec<ImageMime> {
        self.mimes.lock().await.clone()
    }

    pub async fn sizes(&self) -> Vec<usize> {
        self.sizes.lock().await.clone()
    }
}

#[async_trait]
impl MealVisionAnalyzer for ScriptedVision {
    async fn analyze_meal(
        &self,
        image: &[u8],
        mime: ImageMime,
    ) -> Result<MealAnalysis, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.mimes.lock().await.push(mime);
        self.sizes.lock().await.push(image.len());
        if let Some(message) = self.failures.lock().await.pop_front() {
            return Err(upstream_error(&message));
        }
        Ok(self.reply.clone())
    }
}

/// Classifier fake: pops scripted failures first, then zones each name from
/// `zones` (green when not listed). Names in `withheld` are left out of the
/// reply.
pub struct ScriptedClassifier {
    zones: HashMap<String, Zone>,
    failures: Mutex<VecDeque<String>>,
    withheld: Mutex<Vec<String>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<String>>>,
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self::with_zones(&[])
    }
}

impl ScriptedClassifier {
    pub fn with_zones(zones: &[(&str, Zone)]) -> Self {
        Self {
            zones: zones
                .iter()
                .map(|(name, zone)| (name.to_string(), *zone))
                .collect(),
            failures: Mutex::new(VecDeque::new()),
            withheld: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn fail_next(&self, times: usize) {
        let mut failures = self.failures.lock().await;
        for i in 0..times {
            failures.push_back(format!("classification timeout after {}ms", 1000 + i));
        }
    }

    pub async fn withhold(&self, names: &[&str]) {
        *self.withheld.lock().await = names.iter().map(|n| n.to_string()).collect();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl IngredientClassifier for ScriptedClassifier {
    async fn classify(&self, ingredients: &[String]) -> Result<Vec<ZoneAssignment>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(ingredients.to_vec());
        if let Some(message) = self.failures.lock().await.pop_front() {
            return Err(upstream_error(&message));
        }
        let withheld = self.withheld.lock().await.clone();
        Ok(ingredients
            .iter()
            .filter(|name| !withheld.contains(name))
            .map(|name| ZoneAssignment {
                name: name.to_uppercase(),
                zone: self.zones.get(name).copied().unwrap_or(Zone::Green),
            })
            .collect())
    }
}

/// Shared counter store that never answers.
pub struct DownCounterStore;

#[async_trait]
impl CounterStore for DownCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn hit(
        &self,
        _key: &str,
        _limit: u32,
        _window: Duration,
        _now: DateTime<Utc>,
    ) -> StoreOutcome {
        StoreOutcome::Unavailable("connection refused".to_string())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(250)))
    }
}

/// Everything a test needs to drive and inspect the service.
pub struct TestApp {
    pub state: AppState,
    pub repo: Arc<MemoryFoodRepository>,
    pub vision: Arc<ScriptedVision>,
    pub classifier: Arc<ScriptedClassifier>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }
}

/// Defaults with recovery visible immediately (no in-flight grace).
pub fn test_config() -> AppConfig {
    AppConfig {
        in_flight_grace_secs: 0,
        ..AppConfig::default()
    }
}

pub async fn build_test_app(config: AppConfig) -> TestApp {
    build_test_app_with(config, None, ScriptedClassifier::default()).await
}

pub async fn build_test_app_with(
    config: AppConfig,
    counter_store: Option<Arc<dyn CounterStore>>,
    classifier: ScriptedClassifier,
) -> TestApp {
    let repo = Arc::new(MemoryFoodRepository::new());
    let vision = Arc::new(ScriptedVision::returning(curry_analysis()));
    let classifier = Arc::new(classifier);
    let clock = Arc::new(ManualClock::default());

    let state = AppState::assemble(
        &config,
        repo.clone(),
        counter_store,
        vision.clone(),
        classifier.clone(),
        clock.clone(),
    )
    .await;

    TestApp {
        state,
        repo,
        vision,
        classifier,
        clock,
    }
}

/// Collect a response body as JSON.
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

pub fn post_json(uri: &str, user: Option<&str>, body: &serde_json::Value) -> Request<Body> {
    let payload = body.to_string();
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("content-length", payload.len());
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    builder
        .body(Body::from(payload))
        .expect("build request")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}
