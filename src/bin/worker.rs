use meal_zone_guard::{app_state::AppState, config::AppConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting meal-zone-guard recovery worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    if !config.recovery_enabled {
        tracing::warn!("RECOVERY_ENABLED is false; nothing for the worker to do");
        return;
    }

    // Initialize services
    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize services");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = state.spawn_background_tasks(shutdown_rx);

    tracing::info!(
        scan_interval_secs = config.recovery_scan_interval_secs,
        batch_size = config.recovery_batch_size,
        "Worker ready"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task ended abnormally");
        }
    }

    let totals = state.recovery.totals();
    tracing::info!(
        ticks = totals.ticks,
        recovered = totals.recovered,
        retried = totals.retried,
        parked = totals.parked,
        "Worker stopped"
    );
}
