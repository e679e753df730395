//! Priority job queue shared by the scheduler, the event listeners and the
//! worker pool.
//!
//! Dequeue order is `(priority desc, created_at asc)` with an insertion
//! sequence as the final tie-breaker, restricted to jobs whose
//! `available_at` has passed. All access goes through one mutex; blocked
//! consumers park on a [`Notify`] that enqueue and close wake up.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::errors::QueueError;
use crate::models::job::chrono_duration;
use crate::models::{Job, JobType, Payload, Priority, DEFAULT_MAX_RETRIES};

/// Upper bound on a single wait for a delayed job, so wall-clock jumps are
/// picked up reasonably quickly.
const MAX_DELAY_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    created_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: BTreeMap<QueueKey, Job>,
    last_enqueued: HashMap<JobType, DateTime<Utc>>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn insert(&mut self, job: Job) {
        let key = QueueKey {
            priority: Reverse(job.priority()),
            created_at: job.created_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.jobs.insert(key, job);
    }

    /// Removes the first ready job, or reports the earliest time a delayed
    /// job becomes ready.
    fn take_ready(&mut self, now: DateTime<Utc>) -> Result<Job, Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        let mut ready_key = None;

        for (key, job) in &self.jobs {
            if job.is_ready(now) {
                ready_key = Some(*key);
                break;
            }
            let at = job.available_at();
            earliest = Some(earliest.map_or(at, |e| e.min(at)));
        }

        match ready_key.and_then(|key| self.jobs.remove(&key)) {
            Some(job) => Ok(job),
            None => Err(earliest),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub ready: usize,
    pub delayed: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub capacity: Option<usize>,
    pub closed: bool,
}

pub struct JobManager {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: Option<usize>,
    default_max_retries: u32,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Bounded queue: enqueue fails with [`QueueError::Full`] instead of
    /// blocking once `capacity` jobs are pending. Zero means unbounded.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = (capacity > 0).then_some(capacity);
        self
    }

    /// Retry budget given to jobs created by [`JobManager::enqueue_if_should_run`].
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    pub fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            self.check_accepting(&state)?;
            debug!(job_id = %job.id, job_type = %job.job_type, priority = %job.priority(), "Job enqueued");
            state.insert(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Enqueues unless a job of the same type is already pending.
    /// Returns whether the job was added.
    pub fn enqueue_if_absent(&self, job: Job) -> Result<bool, QueueError> {
        {
            let mut state = self.state.lock();
            self.check_accepting(&state)?;
            if state.jobs.values().any(|pending| pending.job_type == job.job_type) {
                return Ok(false);
            }
            state.insert(job);
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Puts a job back after a failed attempt. Retries already held a slot,
    /// so the capacity limit does not apply.
    pub(crate) fn requeue(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.insert(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Interval-gated enqueue keyed by job type.
    ///
    /// Enqueues only if at least `interval` has passed since the last
    /// successful enqueue of `job_type` (not its completion). Failures are
    /// logged and reported as `false`; the timestamp is only advanced on
    /// success.
    pub fn enqueue_if_should_run(
        &self,
        job_type: JobType,
        priority: Priority,
        interval: Duration,
        payload: Payload,
    ) -> bool {
        self.enqueue_if_should_run_at(job_type, priority, interval, payload, Utc::now())
    }

    pub fn enqueue_if_should_run_at(
        &self,
        job_type: JobType,
        priority: Priority,
        interval: Duration,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> bool {
        {
            let mut state = self.state.lock();

            if let Some(last) = state.last_enqueued.get(&job_type) {
                if now.signed_duration_since(*last) < chrono_duration(interval) {
                    return false;
                }
            }

            let job = Job::new_at(job_type.clone(), priority, payload, now)
                .with_max_retries(self.default_max_retries);
            if let Err(e) = self.check_accepting(&state) {
                warn!(job_id = %job.id, job_type = %job_type, error = %e, "Interval-gated enqueue failed");
                return false;
            }

            debug!(job_id = %job.id, job_type = %job_type, "Interval-gated job enqueued");
            state.insert(job);
            state.last_enqueued.insert(job_type, now);
        }
        self.notify.notify_waiters();
        true
    }

    /// Waits for the highest-priority ready job. Returns
    /// [`QueueError::Closed`] once the manager is closed.
    pub async fn dequeue(&self) -> Result<Job, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent enqueue is not missed.
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                match state.take_ready(Utc::now()) {
                    Ok(job) => return Ok(job),
                    Err(earliest) => earliest,
                }
            };

            match wait {
                Some(at) => {
                    let delay = at
                        .signed_duration_since(Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(MAX_DELAY_WAIT);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Non-blocking dequeue. `None` when nothing is ready or the manager is closed.
    pub fn try_dequeue(&self) -> Option<Job> {
        self.try_dequeue_at(Utc::now())
    }

    pub fn try_dequeue_at(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.take_ready(now).ok()
    }

    /// Stops accepting work and releases every blocked `dequeue`.
    /// Pending jobs are dropped.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let dropped = state.jobs.len();
            state.jobs.clear();
            dropped
        };
        self.notify.notify_waiters();
        info!(dropped_jobs = dropped, "Job manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn has_pending(&self, job_type: &JobType) -> bool {
        self.state.lock().jobs.values().any(|job| &job.job_type == job_type)
    }

    pub fn last_enqueued(&self, job_type: &JobType) -> Option<DateTime<Utc>> {
        self.state.lock().last_enqueued.get(job_type).copied()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let state = self.state.lock();

        let ready = state.jobs.values().filter(|job| job.is_ready(now)).count();
        let mut by_priority: BTreeMap<String, usize> = Priority::ALL
            .iter()
            .map(|p| (p.to_string(), 0))
            .collect();
        for job in state.jobs.values() {
            *by_priority.entry(job.priority().to_string()).or_default() += 1;
        }

        QueueStats {
            pending: state.jobs.len(),
            ready,
            delayed: state.jobs.len() - ready,
            by_priority,
            capacity: self.capacity,
            closed: state.closed,
        }
    }

    fn check_accepting(&self, state: &QueueState) -> Result<(), QueueError> {
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(capacity) = self.capacity {
            if state.jobs.len() >= capacity {
                return Err(QueueError::Full { capacity });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobManager")
            .field("pending", &state.jobs.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
