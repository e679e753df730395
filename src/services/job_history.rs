use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::models::{EventType, JobStatus, JobStatusData};
use crate::services::event_bus::{EventBus, SubscriptionId};

/// One finished job run as seen on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

impl From<&JobStatusData> for JobRun {
    fn from(data: &JobStatusData) -> Self {
        Self {
            job_id: data.job_id.clone(),
            job_type: data.job_type.clone(),
            status: data.status,
            error_message: data.error.clone(),
            duration_ms: data.duration.map(|secs| (secs * 1000.0).round() as u64),
            finished_at: data.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunStats {
    pub job_type: String,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub avg_duration_ms: Option<f64>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<JobStatus>,
}

/// Bounded in-memory audit log of completed and failed jobs.
///
/// Oldest runs are evicted once `capacity` is reached.
#[derive(Clone)]
pub struct JobHistory {
    runs: Arc<Mutex<VecDeque<JobRun>>>,
    capacity: usize,
}

impl JobHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            runs: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Records every terminal job event published on `bus`.
    pub fn attach(&self, bus: &EventBus) -> [SubscriptionId; 2] {
        [EventType::JobCompleted, EventType::JobFailed].map(|event_type| {
            let history = self.clone();
            bus.subscribe(event_type, move |event| {
                if let Some(data) = event.job_status_data() {
                    history.record(JobRun::from(data));
                }
            })
        })
    }

    pub fn record(&self, run: JobRun) {
        let mut runs = self.runs.lock();
        if runs.len() == self.capacity {
            runs.pop_front();
        }
        runs.push_back(run);
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<JobRun> {
        self.runs.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn for_type(&self, job_type: &str, limit: usize) -> Vec<JobRun> {
        self.runs
            .lock()
            .iter()
            .rev()
            .filter(|run| run.job_type == job_type)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self, job_type: &str) -> JobRunStats {
        let runs = self.runs.lock();
        let matching: Vec<&JobRun> = runs.iter().filter(|run| run.job_type == job_type).collect();

        let successful_runs = matching
            .iter()
            .filter(|run| run.status == JobStatus::Completed)
            .count();
        let durations: Vec<u64> = matching.iter().filter_map(|run| run.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
        };
        let last = matching.last();

        JobRunStats {
            job_type: job_type.to_string(),
            total_runs: matching.len(),
            successful_runs,
            failed_runs: matching.len() - successful_runs,
            avg_duration_ms,
            last_run: last.map(|run| run.finished_at),
            last_status: last.map(|run| run.status),
        }
    }

    /// Drops runs that finished before `now - max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: std::time::Duration, now: DateTime<Utc>) -> usize {
        let cutoff = ChronoDuration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|run| run.finished_at >= cutoff);
        before - runs.len()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}
