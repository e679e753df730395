use axum::{extract::State, http::StatusCode, routing::get, Router};
use tracing::info;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health))
        .route("/ready", get(ready))
}

async fn health() -> &'static str {
    info!("GET /health - Health check");
    "OK"
}

/// Ready once workers are consuming and the queue accepts jobs.
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.manager.is_closed() {
        (StatusCode::SERVICE_UNAVAILABLE, "Job manager closed")
    } else if !state.pool.is_running() {
        (StatusCode::SERVICE_UNAVAILABLE, "Workers not running")
    } else {
        (StatusCode::OK, "READY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_ready_reflects_pool_and_queue() {
        let state = AppState::from_config(&EngineConfig::default());
        assert_eq!(ready(State(state.clone())).await.0, StatusCode::SERVICE_UNAVAILABLE);

        state.pool.start();
        assert_eq!(ready(State(state.clone())).await.0, StatusCode::OK);

        state.manager.close();
        assert_eq!(ready(State(state.clone())).await.0, StatusCode::SERVICE_UNAVAILABLE);
        state.pool.stop().await;
    }
}
