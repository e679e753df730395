//! Queue Health Check Job
//!
//! Runs hourly from the time scheduler. Inspects the job queue and fails
//! when the backlog of jobs that are ready to run but not yet picked up
//! grows past a threshold, which usually means workers are stuck or a
//! handler is much slower than its cadence.
//!
//! # Payload
//!
//! - `max_ready_backlog` (optional, integer): overrides the configured threshold

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::Payload;
use crate::services::job_queue::JobManager;
use crate::services::progress_reporter::ProgressReporter;
use crate::services::worker_pool::JobHandler;

pub const DEFAULT_MAX_READY_BACKLOG: usize = 500;

pub struct HealthCheckJob {
    manager: Arc<JobManager>,
    max_ready_backlog: usize,
}

impl HealthCheckJob {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            max_ready_backlog: DEFAULT_MAX_READY_BACKLOG,
        }
    }

    pub fn with_max_ready_backlog(mut self, max_ready_backlog: usize) -> Self {
        self.max_ready_backlog = max_ready_backlog;
        self
    }
}

#[async_trait]
impl JobHandler for HealthCheckJob {
    async fn handle(&self, payload: Payload, progress: Arc<ProgressReporter>) -> anyhow::Result<()> {
        let threshold = payload
            .get("max_ready_backlog")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_ready_backlog);

        progress.report_unthrottled_with_details(0, 2, "Inspecting job queue", "queue", "", None);

        let stats = self.manager.stats();
        let mut details = Map::new();
        details.insert("pending".to_string(), Value::from(stats.pending));
        details.insert("ready".to_string(), Value::from(stats.ready));
        details.insert("delayed".to_string(), Value::from(stats.delayed));
        details.insert("threshold".to_string(), Value::from(threshold));
        progress.report_unthrottled_with_details(1, 2, "Queue inspected", "queue", "", Some(details));

        if stats.closed {
            bail!("job manager is closed");
        }
        if stats.ready > threshold {
            warn!(ready = stats.ready, threshold, "Job backlog above threshold");
            bail!("ready backlog {} exceeds threshold {}", stats.ready, threshold);
        }

        progress.report(2, 2, "Health check passed");
        info!(pending = stats.pending, ready = stats.ready, delayed = stats.delayed, "Health check passed");
        Ok(())
    }
}
