use serde::Deserialize;
use std::time::Duration;

use crate::services::analysis::PipelineSettings;
use crate::services::compression::DEFAULT_COMPRESSION_TARGET_BYTES;
use crate::services::health_monitor::HealthPolicy;
use crate::services::image_validation::DEFAULT_MAX_IMAGE_BYTES;
use crate::services::inference::{DEFAULT_CLASSIFICATION_MODEL, DEFAULT_VISION_MODEL};
use crate::services::rate_limit::{ClassLimit, RateLimitConfig};
use crate::services::recovery::{RecoveryConfig, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Records stay in memory when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Redis connection string for shared rate-limit counters. Limits are
    /// enforced per instance when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Cloudflare account ID
    #[serde(default)]
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    #[serde(default)]
    pub cf_api_token: String,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_classification_model")]
    pub classification_model: String,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    // ── Admission ────────────────────────────────────────────────────────
    #[serde(default = "default_vision_requests_per_minute")]
    pub vision_requests_per_minute: u32,

    #[serde(default = "default_classification_requests_per_minute")]
    pub classification_requests_per_minute: u32,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    // ── Images ───────────────────────────────────────────────────────────
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    #[serde(default = "default_compression_target_bytes")]
    pub compression_target_bytes: usize,

    // ── Recovery ─────────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub recovery_enabled: bool,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    #[serde(default = "default_recovery_batch_size")]
    pub recovery_batch_size: usize,

    #[serde(default = "default_recovery_scan_interval_secs")]
    pub recovery_scan_interval_secs: u64,

    /// Grace period before a just-submitted record becomes visible to recovery.
    #[serde(default = "default_in_flight_grace_secs")]
    pub in_flight_grace_secs: u64,

    // ── Health ───────────────────────────────────────────────────────────
    #[serde(default = "default_health_cleanup_interval_secs")]
    pub health_cleanup_interval_secs: u64,

    #[serde(default = "default_health_slow_call_ms")]
    pub health_slow_call_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_vision_model() -> String {
    DEFAULT_VISION_MODEL.to_string()
}

fn default_classification_model() -> String {
    DEFAULT_CLASSIFICATION_MODEL.to_string()
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_vision_requests_per_minute() -> u32 {
    10
}

fn default_classification_requests_per_minute() -> u32 {
    60
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_max_image_bytes() -> usize {
    DEFAULT_MAX_IMAGE_BYTES
}

fn default_compression_target_bytes() -> usize {
    DEFAULT_COMPRESSION_TARGET_BYTES
}

fn default_true() -> bool {
    true
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    60
}

fn default_retry_max_delay_secs() -> u64 {
    3600
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

fn default_recovery_batch_size() -> usize {
    10
}

fn default_recovery_scan_interval_secs() -> u64 {
    300
}

fn default_in_flight_grace_secs() -> u64 {
    120
}

fn default_health_cleanup_interval_secs() -> u64 {
    300
}

fn default_health_slow_call_ms() -> u64 {
    8_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            redis_url: None,
            cf_account_id: String::new(),
            cf_api_token: String::new(),
            vision_model: default_vision_model(),
            classification_model: default_classification_model(),
            inference_timeout_secs: default_inference_timeout_secs(),
            vision_requests_per_minute: default_vision_requests_per_minute(),
            classification_requests_per_minute: default_classification_requests_per_minute(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            max_image_bytes: default_max_image_bytes(),
            compression_target_bytes: default_compression_target_bytes(),
            recovery_enabled: true,
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            recovery_batch_size: default_recovery_batch_size(),
            recovery_scan_interval_secs: default_recovery_scan_interval_secs(),
            in_flight_grace_secs: default_in_flight_grace_secs(),
            health_cleanup_interval_secs: default_health_cleanup_interval_secs(),
            health_slow_call_ms: default_health_slow_call_ms(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn rate_limits(&self) -> RateLimitConfig {
        let window = Duration::from_secs(self.rate_limit_window_secs.max(1));
        RateLimitConfig {
            vision: ClassLimit {
                max_requests: self.vision_requests_per_minute,
                window,
            },
            classification: ClassLimit {
                max_requests: self.classification_requests_per_minute,
                window,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            retry: self.retry_policy(),
            batch_size: self.recovery_batch_size.max(1),
            scan_interval: Duration::from_secs(self.recovery_scan_interval_secs.max(1)),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            slow_call_ms: self.health_slow_call_ms,
            ..HealthPolicy::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            compression_target_bytes: self.compression_target_bytes,
            in_flight_grace: Duration::from_secs(self.in_flight_grace_secs),
        }
    }

    pub fn health_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.health_cleanup_interval_secs.max(1))
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs.max(1))
    }
}
