use axum::Router;
use tower_http::cors::CorsLayer;

use crate::routes::{events, health, jobs};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .nest("/health", health::router())
        .nest("/api/jobs", jobs::router())
        .nest("/api/events", events::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
