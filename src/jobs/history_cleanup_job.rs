//! Job History Cleanup
//!
//! Daily job that drops audit records older than the retention window from
//! the in-memory [`JobHistory`].
//!
//! # Payload
//!
//! - `retention_hours` (optional, integer): overrides the default retention

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::models::Payload;
use crate::services::job_history::JobHistory;
use crate::services::progress_reporter::ProgressReporter;
use crate::services::worker_pool::JobHandler;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct HistoryCleanupJob {
    history: JobHistory,
    retention: Duration,
}

impl HistoryCleanupJob {
    pub fn new(history: JobHistory) -> Self {
        Self {
            history,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

#[async_trait]
impl JobHandler for HistoryCleanupJob {
    async fn handle(&self, payload: Payload, progress: Arc<ProgressReporter>) -> anyhow::Result<()> {
        let retention = payload
            .get("retention_hours")
            .and_then(Value::as_u64)
            .map(|hours| Duration::from_secs(hours.saturating_mul(3600)))
            .unwrap_or(self.retention);

        progress.report_message("Pruning job history");
        let removed = self.history.prune_older_than(retention, Utc::now());
        progress.report(1, 1, "Job history pruned");

        info!(removed, remaining = self.history.len(), "Job history cleaned up");
        Ok(())
    }
}
