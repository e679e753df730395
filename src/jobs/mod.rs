//! Built-in Jobs
//!
//! Handlers the engine registers for itself. Domain handlers (broker sync,
//! planning, backups) are registered by the embedding application through
//! [`HandlerRegistry`].
//!
//! # Available Jobs
//!
//! - `health_check_job` - Fails when the ready backlog exceeds a threshold
//! - `history_cleanup_job` - Prunes the in-memory job run history

pub mod health_check_job;
pub mod history_cleanup_job;

use std::sync::Arc;
use tracing::info;

use crate::models::JobType;
use crate::services::job_history::JobHistory;
use crate::services::job_queue::JobManager;
use crate::services::worker_pool::HandlerRegistry;

pub use health_check_job::HealthCheckJob;
pub use history_cleanup_job::HistoryCleanupJob;

pub fn register_builtin_jobs(registry: &HandlerRegistry, manager: Arc<JobManager>, history: JobHistory) {
    registry.register(JobType::HEALTH_CHECK, HealthCheckJob::new(manager));
    registry.register(JobType::HISTORY_CLEANUP, HistoryCleanupJob::new(history));
    info!("Built-in jobs registered");
}
