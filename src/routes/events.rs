use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Serialize;
use tracing::info;

use crate::errors::AppError;
use crate::models::{
    DividendDetectedData, EventData, EventType, RecommendationsReadyData, StateChangedData,
};
use crate::state::AppState;

const MODULE: &str = "api";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/state-changed", post(state_changed))
        .route("/recommendations-ready", post(recommendations_ready))
        .route("/dividend-detected", post(dividend_detected))
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    event_type: EventType,
    delivered: usize,
}

fn publish(state: &AppState, event_type: EventType, data: EventData) -> (StatusCode, Json<PublishResponse>) {
    let delivered = state.bus.emit(event_type, MODULE, data);
    info!(event_type = %event_type, delivered, "Event published");
    (StatusCode::ACCEPTED, Json(PublishResponse { event_type, delivered }))
}

/// POST /api/events/state-changed - Portfolio state hash moved
async fn state_changed(
    State(state): State<AppState>,
    Json(body): Json<StateChangedData>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    if body.new_hash.trim().is_empty() {
        return Err(AppError::Validation("new_hash is required".to_string()));
    }
    Ok(publish(&state, EventType::StateChanged, EventData::StateChanged(body)))
}

/// POST /api/events/recommendations-ready - Planner produced a recommendation set
async fn recommendations_ready(
    State(state): State<AppState>,
    Json(body): Json<RecommendationsReadyData>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    if body.portfolio_hash.trim().is_empty() {
        return Err(AppError::Validation("portfolio_hash is required".to_string()));
    }
    Ok(publish(
        &state,
        EventType::RecommendationsReady,
        EventData::RecommendationsReady(body),
    ))
}

/// POST /api/events/dividend-detected - Broker reported a dividend
async fn dividend_detected(
    State(state): State<AppState>,
    Json(body): Json<DividendDetectedData>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    if body.symbol.trim().is_empty() {
        return Err(AppError::Validation("symbol is required".to_string()));
    }
    if !body.amount.is_finite() || body.amount <= 0.0 {
        return Err(AppError::Validation("amount must be positive".to_string()));
    }
    Ok(publish(&state, EventType::DividendDetected, EventData::DividendDetected(body)))
}
