use std::sync::Arc;

use sentinel_backend::logging::{init_logging, LoggingConfig};
use sentinel_backend::services::event_listeners::{default_rules, EventListeners};
use sentinel_backend::services::time_scheduler::TimeScheduler;
use sentinel_backend::{create_app, jobs, AppState, EngineConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging FIRST
    init_logging(LoggingConfig::from_env())?;

    let config = EngineConfig::from_env();
    config.validate()?;
    info!(
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        max_retries = config.default_max_retries,
        "⚙️ Job engine configuration loaded"
    );

    let state = AppState::from_config(&config);
    jobs::register_builtin_jobs(&state.registry, state.manager.clone(), state.history.clone());

    let listeners = EventListeners::register(
        &state.bus,
        state.manager.clone(),
        default_rules(config.default_max_retries),
    );

    let scheduler = Arc::new(
        TimeScheduler::new(state.manager.clone())
            .with_fallback_sync_interval(config.fallback_sync_interval),
    );
    scheduler.set_deployment_interval(config.deployment_check_interval);

    let mut expected = scheduler.scheduled_job_types();
    expected.extend(listeners.job_types());
    for job_type in state.registry.missing(expected.iter()) {
        warn!(
            job_type = %job_type,
            "⚠️ No handler registered for scheduled job type, its jobs will fail"
        );
    }

    state.pool.start();
    scheduler.start();

    let app = create_app(state.clone());
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("🚀 Sentinel backend running at http://{}/", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("🛑 Shutting down job engine");
    scheduler.stop().await;
    listeners.unregister();
    state.pool.stop().await;
    state.manager.close();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
