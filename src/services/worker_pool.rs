//! Handler registry and the worker pool that drains the [`JobManager`].
//!
//! Each worker loops: dequeue → resolve handler → `JOB_STARTED` → run the
//! handler → `JOB_COMPLETED`, or retry with capped exponential backoff until
//! the job's retry budget is spent, then `JOB_FAILED`. A panicking or
//! timed-out handler counts as an ordinary failure. A job type with no
//! handler fails immediately without retries.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::errors::QueueError;
use crate::models::job::add_duration;
use crate::models::{Event, Job, JobStatus, JobStatusData, JobType, Payload};
use crate::services::event_bus::{panic_message, EventBus};
use crate::services::job_queue::JobManager;
use crate::services::progress_reporter::{ProgressReporter, DEFAULT_PROGRESS_THROTTLE};

const MODULE: &str = "queue";

// ==============================================================================
// Handlers
// ==============================================================================

/// Business logic behind one job type.
///
/// Returning an error makes the attempt eligible for retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: Payload, progress: Arc<ProgressReporter>) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Payload, Arc<ProgressReporter>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: Payload, progress: Arc<ProgressReporter>) -> anyhow::Result<()> {
        (self.0)(payload, progress).await
    }
}

#[derive(Clone)]
pub struct RegisteredHandler {
    handler: Arc<dyn JobHandler>,
    timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerInfo {
    pub job_type: JobType,
    pub description: String,
    pub timeout_seconds: Option<u64>,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<JobType, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&self, job_type: JobType, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.insert(job_type, Arc::new(handler), None);
    }

    /// Registers a handler whose attempts are cut off after `timeout`.
    pub fn register_with_timeout<H>(&self, job_type: JobType, handler: H, timeout: Duration)
    where
        H: JobHandler + 'static,
    {
        self.insert(job_type, Arc::new(handler), Some(timeout));
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, job_type: JobType, f: F)
    where
        F: Fn(Payload, Arc<ProgressReporter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(job_type, Arc::new(FnHandler(f)), None);
    }

    fn insert(&self, job_type: JobType, handler: Arc<dyn JobHandler>, timeout: Option<Duration>) {
        if self
            .handlers
            .insert(job_type.clone(), RegisteredHandler { handler, timeout })
            .is_some()
        {
            warn!(job_type = %job_type, "Handler replaced");
        } else {
            debug!(job_type = %job_type, "Handler registered");
        }
    }

    pub fn get(&self, job_type: &JobType) -> Option<RegisteredHandler> {
        self.handlers.get(job_type).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Job types from `expected` that have no handler.
    pub fn missing<'a>(&self, expected: impl IntoIterator<Item = &'a JobType>) -> Vec<JobType> {
        let mut missing: Vec<JobType> = expected
            .into_iter()
            .filter(|job_type| !self.contains(job_type))
            .cloned()
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn describe(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .handlers
            .iter()
            .map(|entry| HandlerInfo {
                job_type: entry.key().clone(),
                description: entry.key().description().to_string(),
                timeout_seconds: entry.value().timeout.map(|t| t.as_secs()),
            })
            .collect();
        infos.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        infos
    }
}

// ==============================================================================
// Retry Policy
// ==============================================================================

/// Capped exponential backoff with optional proportional jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added at random, 0.0 to 1.0.
    pub jitter: f64,
}

impl RetryBackoff {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before the attempt following failure number `retries` (1-based).
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries.saturating_sub(1));
        let delay = self.base.saturating_mul(factor).min(self.max);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + extra).min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

// ==============================================================================
// Worker Pool
// ==============================================================================

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub backoff: RetryBackoff,
    pub progress_throttle: Duration,
    /// Applies to handlers registered without their own timeout.
    pub default_timeout: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            backoff: RetryBackoff::default(),
            progress_throttle: DEFAULT_PROGRESS_THROTTLE,
            default_timeout: None,
        }
    }
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.worker_count.max(1),
            backoff: RetryBackoff {
                base: config.retry_backoff_base,
                max: config.retry_backoff_max,
                jitter: config.retry_backoff_jitter,
            },
            progress_throttle: config.progress_throttle,
            default_timeout: config.job_timeout,
        }
    }
}

/// What happened to a job after one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Retrying { retries: u32, delay: Duration },
    Failed(QueueError),
}

#[derive(Default)]
struct Lifecycle {
    token: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub running: bool,
    pub in_flight: usize,
    pub registered_handlers: usize,
}

pub struct WorkerPool {
    manager: Arc<JobManager>,
    registry: HandlerRegistry,
    bus: Option<EventBus>,
    config: WorkerPoolConfig,
    in_flight: AtomicUsize,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkerPool {
    pub fn new(
        manager: Arc<JobManager>,
        registry: HandlerRegistry,
        bus: Option<EventBus>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            bus,
            config,
            in_flight: AtomicUsize::new(0),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().token.is_some()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.config.workers,
            running: self.is_running(),
            in_flight: self.in_flight(),
            registered_handlers: self.registry.len(),
        }
    }

    /// Spawns the workers. A no-op while already running.
    pub fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.token.is_some() {
            info!("Worker pool already running");
            return;
        }

        let token = CancellationToken::new();
        lifecycle.handles = (0..self.config.workers)
            .map(|worker_id| tokio::spawn(self.clone().run_worker(worker_id, token.clone())))
            .collect();
        lifecycle.token = Some(token);

        info!(workers = self.config.workers, "Worker pool started");
    }

    /// Stops pulling new jobs, lets in-flight jobs finish, and waits for
    /// every worker to exit.
    pub async fn stop(&self) {
        let (token, handles) = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.token.take() {
                Some(token) => (token, std::mem::take(&mut lifecycle.handles)),
                None => return,
            }
        };

        token.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, token: CancellationToken) {
        debug!(worker_id, "Worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.manager.dequeue() => match next {
                    Ok(job) => job,
                    Err(QueueError::Closed) => break,
                    Err(e) => {
                        warn!(worker_id, error = %e, "Dequeue failed");
                        continue;
                    }
                },
            };

            self.process_job(job).await;
        }
        debug!(worker_id, "Worker exited");
    }

    /// Runs one attempt of `job` and applies the retry policy.
    pub async fn process_job(&self, mut job: Job) -> JobOutcome {
        let Some(entry) = self.registry.get(&job.job_type) else {
            let err = QueueError::UnknownJobType(job.job_type.to_string());
            error!(job_id = %job.id, job_type = %job.job_type, "No handler registered, dropping job");
            self.emit_failed(&job, &err, Duration::ZERO);
            return JobOutcome::Failed(err);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.emit(&job, JobStatus::Started, |_| {});
        debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.retries + 1, "Job started");

        let progress = Arc::new(ProgressReporter::with_min_interval(
            self.bus.clone(),
            job.id.clone(),
            job.job_type.clone(),
            self.config.progress_throttle,
        ));
        let timeout = entry.timeout.or(self.config.default_timeout);

        let started = Instant::now();
        let result = run_handler(entry, job.payload.clone(), progress, timeout).await;
        let duration = started.elapsed();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let err = match result {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                self.emit(&job, JobStatus::Completed, |data| {
                    data.duration = Some(duration.as_secs_f64());
                });
                return JobOutcome::Completed;
            }
            Err(err) => err,
        };

        job.retries += 1;
        if err.is_permanent() || job.retries_exhausted() {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.retries,
                error = %err,
                "Job failed"
            );
            self.emit_failed(&job, &err, duration);
            return JobOutcome::Failed(err);
        }

        let delay = self.config.backoff.delay_for(job.retries);
        job.set_available_at(add_duration(Utc::now(), delay));
        let retries = job.retries;
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            retries,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Job attempt failed, retrying"
        );

        match self.manager.requeue(job.clone()) {
            Ok(()) => JobOutcome::Retrying { retries, delay },
            Err(requeue_err) => {
                error!(job_id = %job.id, error = %requeue_err, "Could not requeue job for retry");
                self.emit_failed(&job, &err, duration);
                JobOutcome::Failed(err)
            }
        }
    }

    fn emit_failed(&self, job: &Job, err: &QueueError, duration: Duration) {
        self.emit(job, JobStatus::Failed, |data| {
            data.error = Some(err.to_string());
            data.duration = Some(duration.as_secs_f64());
            let mut metadata = Map::new();
            metadata.insert("attempts".to_string(), Value::from(job.retries));
            metadata.insert("max_retries".to_string(), Value::from(job.max_retries));
            data.metadata = Some(metadata);
        });
    }

    fn emit(&self, job: &Job, status: JobStatus, fill: impl FnOnce(&mut JobStatusData)) {
        let Some(bus) = &self.bus else {
            return;
        };
        let mut data = JobStatusData::new(
            &job.id,
            job.job_type.as_str(),
            job.job_type.description(),
            status,
        );
        fill(&mut data);
        bus.publish(Event::job_status(MODULE, data));
    }
}

async fn run_handler(
    entry: RegisteredHandler,
    payload: Payload,
    progress: Arc<ProgressReporter>,
    timeout: Option<Duration>,
) -> Result<(), QueueError> {
    let handler = entry.handler;
    // The handler call itself is inside the guarded future so synchronous
    // panics before the first await are caught too.
    let guarded = AssertUnwindSafe(async move { handler.handle(payload, progress).await }).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(QueueError::TimedOut(limit)),
        },
        None => guarded.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(QueueError::Handler(format!("{:#}", e))),
        Err(panic_info) => Err(QueueError::Panicked(panic_message(&panic_info))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, Priority};
    use std::sync::atomic::AtomicU32;

    fn pool_with(registry: HandlerRegistry, bus: Option<EventBus>) -> (Arc<JobManager>, WorkerPool) {
        let manager = Arc::new(JobManager::new());
        let config = WorkerPoolConfig {
            workers: 1,
            backoff: RetryBackoff::none(),
            ..WorkerPoolConfig::default()
        };
        let pool = WorkerPool::new(manager.clone(), registry, bus, config);
        (manager, pool)
    }

    fn record(bus: &EventBus, event_type: EventType) -> Arc<Mutex<Vec<JobStatusData>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(event_type, move |event| {
            if let Some(data) = event.job_status_data() {
                sink.lock().push(data.clone());
            }
        });
        seen
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let backoff = RetryBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(60), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let backoff = RetryBackoff {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            jitter: 0.5,
        };
        for _ in 0..50 {
            let delay = backoff.delay_for(2);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_registry_reports_missing_handlers() {
        let registry = HandlerRegistry::new();
        registry.register_fn(JobType::SYNC_CYCLE, |_payload, _progress| async { Ok(()) });

        let expected = [JobType::SYNC_CYCLE, JobType::DAILY_BACKUP, JobType::DAILY_BACKUP];
        assert_eq!(registry.missing(expected.iter()), vec![JobType::DAILY_BACKUP]);
        assert_eq!(registry.describe()[0].description, "Syncing all data from broker");
    }

    #[tokio::test]
    async fn test_successful_job_emits_started_and_completed() {
        let bus = EventBus::new();
        let started = record(&bus, EventType::JobStarted);
        let completed = record(&bus, EventType::JobCompleted);

        let registry = HandlerRegistry::new();
        registry.register_fn(JobType::SYNC_CYCLE, |_payload, progress| async move {
            progress.report(1, 1, "done");
            Ok(())
        });
        let (_manager, pool) = pool_with(registry, Some(bus));

        let job = Job::new(JobType::SYNC_CYCLE, Priority::High, Payload::new());
        let job_id = job.id.clone();
        assert_eq!(pool.process_job(job).await, JobOutcome::Completed);

        assert_eq!(started.lock().len(), 1);
        let completed = completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job_id, job_id);
        assert!(completed[0].duration.is_some());
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_requeued_with_incremented_retries() {
        let registry = HandlerRegistry::new();
        registry.register_fn(JobType::SYNC_PRICES, |_payload, _progress| async {
            Err(anyhow::anyhow!("broker unavailable"))
        });
        let (manager, pool) = pool_with(registry, None);

        let job = Job::new(JobType::SYNC_PRICES, Priority::Medium, Payload::new()).with_max_retries(2);
        let outcome = pool.process_job(job).await;
        assert_eq!(outcome, JobOutcome::Retrying { retries: 1, delay: Duration::ZERO });

        let retried = manager.try_dequeue().expect("job requeued");
        assert_eq!(retried.retries, 1);
        assert_eq!(retried.priority(), Priority::Medium);
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_without_retry() {
        let bus = EventBus::new();
        let started = record(&bus, EventType::JobStarted);
        let failed = record(&bus, EventType::JobFailed);
        let (manager, pool) = pool_with(HandlerRegistry::new(), Some(bus));

        let job = Job::new(JobType::new("mystery"), Priority::High, Payload::new());
        let outcome = pool.process_job(job).await;

        assert_eq!(outcome, JobOutcome::Failed(QueueError::UnknownJobType("mystery".into())));
        assert!(manager.is_empty());
        assert!(started.lock().is_empty());
        assert_eq!(failed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_retryable_failure() {
        let registry = HandlerRegistry::new();
        registry.register_fn(JobType::TAG_UPDATE, |_payload, _progress| async {
            panic!("tag table corrupted");
        });
        let (manager, pool) = pool_with(registry, None);

        let job = Job::new(JobType::TAG_UPDATE, Priority::Low, Payload::new()).with_max_retries(0);
        match pool.process_job(job).await {
            JobOutcome::Failed(QueueError::Panicked(msg)) => assert!(msg.contains("tag table corrupted")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(manager.is_empty());
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let registry = HandlerRegistry::new();
        registry.register_with_timeout(
            JobType::CHECK_WAL_CHECKPOINTS,
            FnHandler(|_payload: Payload, _progress: Arc<ProgressReporter>| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
            Duration::from_millis(20),
        );
        let (_manager, pool) = pool_with(registry, None);

        let job = Job::new(JobType::CHECK_WAL_CHECKPOINTS, Priority::Low, Payload::new()).with_max_retries(0);
        assert_eq!(
            pool.process_job(job).await,
            JobOutcome::Failed(QueueError::TimedOut(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register_fn(JobType::HOURLY_BACKUP, move |_payload, _progress| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let (manager, pool) = pool_with(registry, None);
        let pool = Arc::new(pool);

        for _ in 0..3 {
            manager.enqueue(Job::new(JobType::HOURLY_BACKUP, Priority::Medium, Payload::new())).unwrap();
        }
        pool.start();
        pool.start();

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!pool.is_running());
        // Nothing is pulled after stop
        manager.enqueue(Job::new(JobType::HOURLY_BACKUP, Priority::Medium, Payload::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.len(), 1);
    }
}
