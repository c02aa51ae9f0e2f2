use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use meal_zone_guard::app_state::AppState;
use meal_zone_guard::config::AppConfig;
use meal_zone_guard::routes;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing meal-zone-guard server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "meal_analyses_total",
        "Meal photo submissions by outcome"
    );
    metrics::describe_histogram!(
        "meal_analysis_duration_seconds",
        "End-to-end time to analyze and zone a meal photo"
    );
    metrics::describe_counter!(
        "inference_requests_total",
        "Calls to the inference service by service and status"
    );
    metrics::describe_histogram!(
        "inference_request_duration_seconds",
        "Latency of inference service calls"
    );
    metrics::describe_counter!(
        "rate_limit_decisions_total",
        "Admission decisions by class, outcome and counter backend"
    );
    metrics::describe_counter!(
        "rate_limit_store_fallbacks_total",
        "Admission checks served locally because the shared store failed"
    );
    metrics::describe_counter!(
        "recovery_records_total",
        "Records handled by the recovery engine by outcome"
    );
    metrics::describe_gauge!(
        "recovery_pending_review_records",
        "Records parked for manual review at last inspection"
    );

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize services");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = state.spawn_background_tasks(shutdown_rx);

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::monitoring::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting meal-zone-guard on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
