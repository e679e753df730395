//! Background job engine for the portfolio backend: an in-process event
//! bus, a priority job queue with cadence gating, a market-aware time
//! scheduler, event-to-job listeners and a retrying worker pool.

pub mod app;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

mod routes;

pub use app::create_app;
pub use config::EngineConfig;
pub use errors::{AppError, QueueError};
pub use state::AppState;
