use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::{self, FoodRepository, RepositoryError};
use crate::services::{
    analysis::MealAnalysisService,
    clock::{Clock, SystemClock},
    counter_store::{CounterStore, RedisCounterStore, StoreError},
    health_monitor::HealthMonitor,
    image_validation::ImageValidator,
    inference::{
        IngredientClassifier, InferenceError, MealVisionAnalyzer, WorkersAiClient,
        CLASSIFICATION_SERVICE, VISION_SERVICE,
    },
    rate_limit::RateLimiter,
    recovery::RecoveryEngine,
};

/// Budget for the upload pre-check endpoint, per caller.
pub const UPLOAD_CHECKS_PER_MINUTE: u32 = 30;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub analysis: Arc<MealAnalysisService>,
    pub limiter: Arc<RateLimiter>,
    pub monitor: Arc<HealthMonitor>,
    pub repo: Arc<dyn FoodRepository>,
    pub counter_store: Option<Arc<dyn CounterStore>>,
    pub recovery: Arc<RecoveryEngine>,
    pub clock: Arc<dyn Clock>,
    pub recovery_enabled: bool,
    pub health_cleanup_interval: Duration,
}

impl AppState {
    /// Connect every external dependency named in the configuration.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let repo = db::connect_repository(config.database_url.as_deref()).await?;

        let counter_store: Option<Arc<dyn CounterStore>> = match config.redis_url.as_deref() {
            Some(url) => {
                tracing::info!("Using Redis for shared rate-limit counters");
                let store: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(url)?);
                Some(store)
            }
            None => {
                tracing::warn!("REDIS_URL not set; rate limits are enforced per instance only");
                None
            }
        };

        tracing::info!("Initializing Cloudflare Workers AI client");
        let client = Arc::new(WorkersAiClient::new(
            config.cf_account_id.clone(),
            config.cf_api_token.clone(),
            config.vision_model.clone(),
            config.classification_model.clone(),
            config.inference_timeout(),
        )?);

        Ok(Self::assemble(
            config,
            repo,
            counter_store,
            client.clone(),
            client,
            Arc::new(SystemClock),
        )
        .await)
    }

    /// Wire the services together from already-built dependencies.
    pub async fn assemble(
        config: &AppConfig,
        repo: Arc<dyn FoodRepository>,
        counter_store: Option<Arc<dyn CounterStore>>,
        vision: Arc<dyn MealVisionAnalyzer>,
        classifier: Arc<dyn IngredientClassifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let monitor = Arc::new(HealthMonitor::new(config.health_policy(), clock.clone()));
        monitor.register_service(VISION_SERVICE).await;
        monitor.register_service(CLASSIFICATION_SERVICE).await;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limits(),
            counter_store.clone(),
            clock.clone(),
        ));

        let analysis = Arc::new(MealAnalysisService::new(
            ImageValidator::new(config.max_image_bytes),
            config.pipeline_settings(),
            limiter.clone(),
            monitor.clone(),
            repo.clone(),
            vision.clone(),
            classifier.clone(),
            clock.clone(),
        ));

        let recovery = Arc::new(RecoveryEngine::new(
            repo.clone(),
            vision,
            classifier,
            limiter.clone(),
            monitor.clone(),
            clock.clone(),
            config.recovery_config(),
        ));

        Self {
            analysis,
            limiter,
            monitor,
            repo,
            counter_store,
            recovery,
            clock,
            recovery_enabled: config.recovery_enabled,
            health_cleanup_interval: config.health_cleanup_interval(),
        }
    }

    /// Start the recovery engine (when enabled) and the cleanup sweep.
    pub fn spawn_background_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.recovery_enabled {
            handles.push(tokio::spawn(self.recovery.clone().run(shutdown.clone())));
        } else {
            tracing::info!("Recovery engine disabled by configuration");
        }
        handles.push(tokio::spawn(run_cleanup_sweep(
            self.monitor.clone(),
            self.limiter.clone(),
            self.health_cleanup_interval,
            shutdown,
        )));
        handles
    }
}

/// Prune health logs and expired local rate-limit windows on a timer.
async fn run_cleanup_sweep(
    monitor: Arc<HealthMonitor>,
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let log_entries = monitor.cleanup().await;
                let windows = limiter.prune_expired().await;
                tracing::debug!(log_entries, windows, "Cleanup sweep complete");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!("Cleanup sweep stopping");
                    break;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to initialize food repository: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Failed to initialize counter store: {0}")]
    CounterStore(#[from] StoreError),

    #[error("Failed to initialize inference client: {0}")]
    Inference(#[from] InferenceError),
}
