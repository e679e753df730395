//! Time-based job production.
//!
//! Three independent loops feed the [`JobManager`]:
//!
//! - a minute loop matching calendar cadences (daily, weekly, monthly at an
//!   exact `HH:MM` UTC) plus the optional deployment check,
//! - an hourly loop that fires once immediately on start,
//! - a market-aware sync loop that asks a [`MarketStateDetector`] for the
//!   current sync interval every minute.
//!
//! All loops share one cancellation token per `start()` cycle and are joined
//! by `stop()`.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Job, JobType, Payload, Priority};
use crate::services::job_queue::JobManager;
use crate::services::market_hours::MarketStateDetector;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Gate for calendar entries: one enqueue per matching minute even if the
/// ticker fires that minute twice.
const CALENDAR_DEDUPE_WINDOW: Duration = Duration::from_secs(3600);

/// Tick-driven gates are shortened by this much so ticker jitter does not
/// push a run into the following tick.
const GATE_SLACK: Duration = Duration::from_secs(5);

const SYNC_PRIORITY: Priority = Priority::High;

/// Minute loops tick this long after the wall-clock minute starts.
const MINUTE_TICK_OFFSET: Duration = Duration::from_secs(1);

/// Longest run of skipped minutes the minute loops replay after a late tick.
const MAX_CATCH_UP_MINUTES: i64 = 10;

// ==============================================================================
// Cadence Table
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceKind {
    Daily,
    Weekly(Weekday),
    /// Day of month, 1-based.
    Monthly(u32),
}

/// A job fired at an exact UTC time of day, optionally restricted to a
/// weekday or day of month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceEntry {
    pub job_type: JobType,
    pub priority: Priority,
    pub hour: u32,
    pub minute: u32,
    pub kind: CadenceKind,
}

impl CadenceEntry {
    pub fn daily(job_type: JobType, priority: Priority, hour: u32, minute: u32) -> Self {
        Self { job_type, priority, hour, minute, kind: CadenceKind::Daily }
    }

    pub fn weekly(job_type: JobType, priority: Priority, weekday: Weekday, hour: u32, minute: u32) -> Self {
        Self { job_type, priority, hour, minute, kind: CadenceKind::Weekly(weekday) }
    }

    pub fn monthly(job_type: JobType, priority: Priority, day: u32, hour: u32, minute: u32) -> Self {
        Self { job_type, priority, hour, minute, kind: CadenceKind::Monthly(day) }
    }

    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        if now.hour() != self.hour || now.minute() != self.minute {
            return false;
        }
        match self.kind {
            CadenceKind::Daily => true,
            CadenceKind::Weekly(weekday) => now.weekday() == weekday,
            CadenceKind::Monthly(day) => now.day() == day,
        }
    }

    fn label(&self) -> &'static str {
        match self.kind {
            CadenceKind::Daily => "daily",
            CadenceKind::Weekly(_) => "weekly",
            CadenceKind::Monthly(_) => "monthly",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleTable {
    pub calendar: Vec<CadenceEntry>,
    pub hourly: Vec<(JobType, Priority)>,
}

impl ScheduleTable {
    pub fn empty() -> Self {
        Self { calendar: Vec::new(), hourly: Vec::new() }
    }
}

impl Default for ScheduleTable {
    fn default() -> Self {
        Self {
            calendar: vec![
                CadenceEntry::daily(JobType::DAILY_BACKUP, Priority::Medium, 1, 0),
                CadenceEntry::daily(JobType::DAILY_MAINTENANCE, Priority::Low, 2, 0),
                CadenceEntry::daily(JobType::HISTORY_CLEANUP, Priority::Low, 3, 0),
                CadenceEntry::daily(JobType::RECOMMENDATION_GC, Priority::Low, 3, 30),
                CadenceEntry::daily(JobType::CLIENT_DATA_CLEANUP, Priority::Low, 4, 0),
                CadenceEntry::weekly(JobType::WEEKLY_BACKUP, Priority::Medium, Weekday::Sun, 1, 30),
                CadenceEntry::weekly(JobType::WEEKLY_MAINTENANCE, Priority::Low, Weekday::Sun, 5, 0),
                CadenceEntry::monthly(JobType::MONTHLY_BACKUP, Priority::Medium, 1, 2, 30),
                CadenceEntry::monthly(JobType::MONTHLY_MAINTENANCE, Priority::Low, 1, 6, 0),
                CadenceEntry::monthly(JobType::FORMULA_DISCOVERY, Priority::Low, 1, 7, 0),
            ],
            hourly: vec![
                (JobType::HOURLY_BACKUP, Priority::Medium),
                (JobType::HEALTH_CHECK, Priority::Low),
            ],
        }
    }
}

// ==============================================================================
// Scheduler
// ==============================================================================

#[derive(Default)]
struct Lifecycle {
    token: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

pub struct TimeScheduler {
    manager: Arc<JobManager>,
    detector: Option<Arc<dyn MarketStateDetector>>,
    schedule: ScheduleTable,
    fallback_sync_interval: Duration,
    deployment_interval: Mutex<Option<Duration>>,
    /// Minutes since the epoch of the last sync enqueue.
    last_sync_minute: Mutex<Option<i64>>,
    /// Epoch minutes last evaluated by the calendar and market sync loops.
    calendar_cursor: Mutex<Option<i64>>,
    market_cursor: Mutex<Option<i64>>,
    lifecycle: Mutex<Lifecycle>,
}

impl TimeScheduler {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            detector: None,
            schedule: ScheduleTable::default(),
            fallback_sync_interval: Duration::from_secs(15 * 60),
            deployment_interval: Mutex::new(None),
            last_sync_minute: Mutex::new(None),
            calendar_cursor: Mutex::new(None),
            market_cursor: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn MarketStateDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleTable) -> Self {
        self.schedule = schedule;
        self
    }

    /// Sync cadence used when no market-state detector is configured.
    pub fn with_fallback_sync_interval(mut self, interval: Duration) -> Self {
        self.fallback_sync_interval = interval.max(MINUTE);
        self
    }

    pub fn set_deployment_interval(&self, interval: Option<Duration>) {
        *self.deployment_interval.lock() = interval.filter(|i| !i.is_zero());
    }

    /// Every job type this scheduler can produce.
    pub fn scheduled_job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .schedule
            .calendar
            .iter()
            .map(|entry| entry.job_type.clone())
            .chain(self.schedule.hourly.iter().map(|(job_type, _)| job_type.clone()))
            .collect();
        types.push(JobType::SYNC_CYCLE);
        if self.deployment_interval.lock().is_some() {
            types.push(JobType::DEPLOYMENT);
        }
        types.sort();
        types.dedup();
        types
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().token.is_some()
    }

    /// Spawns the cadence loops. A no-op while already running.
    pub fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.token.is_some() {
            info!("Time scheduler already running");
            return;
        }

        let token = CancellationToken::new();
        lifecycle.handles = vec![
            tokio::spawn(self.clone().run_minute_loop(token.clone())),
            tokio::spawn(self.clone().run_hourly_loop(token.clone())),
            tokio::spawn(self.clone().run_market_sync_loop(token.clone())),
        ];
        lifecycle.token = Some(token);

        match &self.detector {
            Some(_) => info!("Time scheduler started with market-aware sync"),
            None => info!(
                fallback_minutes = self.fallback_sync_interval.as_secs() / 60,
                "Time scheduler started without market detector, using fixed sync interval"
            ),
        }
    }

    /// Cancels every loop and waits for them to exit. Nothing is enqueued by
    /// this scheduler once `stop` returns. A no-op when not running.
    pub async fn stop(&self) {
        let (token, handles) = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.token.take() {
                Some(token) => (token, std::mem::take(&mut lifecycle.handles)),
                None => {
                    debug!("Time scheduler stop requested while not running");
                    return;
                }
            }
        };

        token.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Time scheduler stopped");
    }

    async fn run_minute_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = minute_aligned_interval();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.catch_up_calendar_at(Utc::now());
                }
            }
        }
        debug!("Minute loop exited");
    }

    async fn run_hourly_loop(self: Arc<Self>, token: CancellationToken) {
        // First tick completes immediately.
        let mut ticker = interval(HOUR);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick_hourly_at(Utc::now());
                }
            }
        }
        debug!("Hourly loop exited");
    }

    async fn run_market_sync_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = minute_aligned_interval();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.catch_up_market_sync_at(Utc::now());
                }
            }
        }
        debug!("Market sync loop exited");
    }

    /// Evaluates every wall-clock minute since the previous call, ending with
    /// the minute containing `now`, so a late tick cannot skip a cadence.
    pub fn catch_up_calendar_at(&self, now: DateTime<Utc>) -> Vec<JobType> {
        minutes_since(&self.calendar_cursor, now)
            .into_iter()
            .flat_map(|minute| self.tick_calendar_at(minute))
            .collect()
    }

    /// Market sync counterpart of [`Self::catch_up_calendar_at`].
    pub fn catch_up_market_sync_at(&self, now: DateTime<Utc>) -> bool {
        minutes_since(&self.market_cursor, now)
            .into_iter()
            .fold(false, |fired, minute| self.tick_market_sync_at(minute) || fired)
    }

    /// Evaluates calendar cadences and the deployment check for the minute
    /// containing `now`. Returns the job types enqueued.
    pub fn tick_calendar_at(&self, now: DateTime<Utc>) -> Vec<JobType> {
        let mut enqueued = Vec::new();

        for entry in self.schedule.calendar.iter().filter(|e| e.matches(now)) {
            if self.manager.enqueue_if_should_run_at(
                entry.job_type.clone(),
                entry.priority,
                CALENDAR_DEDUPE_WINDOW,
                trigger_payload(entry.label()),
                now,
            ) {
                info!(job_type = %entry.job_type, cadence = entry.label(), "Scheduled job enqueued");
                enqueued.push(entry.job_type.clone());
            }
        }

        let deployment_interval = *self.deployment_interval.lock();
        if let Some(interval) = deployment_interval {
            if self.manager.enqueue_if_should_run_at(
                JobType::DEPLOYMENT,
                Priority::Low,
                interval.saturating_sub(GATE_SLACK),
                trigger_payload("deployment"),
                now,
            ) {
                debug!("Deployment check enqueued");
                enqueued.push(JobType::DEPLOYMENT);
            }
        }

        enqueued
    }

    /// Enqueues the hourly jobs whose gate has opened.
    pub fn tick_hourly_at(&self, now: DateTime<Utc>) -> Vec<JobType> {
        let gate = HOUR.saturating_sub(GATE_SLACK);
        self.schedule
            .hourly
            .iter()
            .filter(|(job_type, priority)| {
                self.manager.enqueue_if_should_run_at(
                    job_type.clone(),
                    *priority,
                    gate,
                    trigger_payload("hourly"),
                    now,
                )
            })
            .map(|(job_type, _)| {
                info!(job_type = %job_type, cadence = "hourly", "Scheduled job enqueued");
                job_type.clone()
            })
            .collect()
    }

    /// Enqueues a sync cycle when the current minute lines up with the
    /// recommended interval and that minute has not synced yet.
    pub fn tick_market_sync_at(&self, now: DateTime<Utc>) -> bool {
        let interval = match &self.detector {
            Some(detector) => detector.sync_interval(now),
            None => self.fallback_sync_interval,
        };

        if interval.is_zero() {
            debug!("Markets closed, skipping sync");
            return false;
        }

        let interval_minutes = (interval.as_secs() / 60).max(1);
        if u64::from(now.minute()) % interval_minutes != 0 {
            return false;
        }

        let epoch_minute = now.timestamp().div_euclid(60);
        let mut last_sync_minute = self.last_sync_minute.lock();
        if *last_sync_minute == Some(epoch_minute) {
            return false;
        }

        let job = Job::new_at(JobType::SYNC_CYCLE, SYNC_PRIORITY, trigger_payload("market_sync"), now)
            .with_max_retries(self.manager.default_max_retries());
        let job_id = job.id.clone();
        match self.manager.enqueue(job) {
            Ok(()) => {
                *last_sync_minute = Some(epoch_minute);
                info!(job_id = %job_id, interval_minutes, "Sync cycle enqueued");
                true
            }
            Err(e) => {
                warn!(job_id = %job_id, job_type = %JobType::SYNC_CYCLE, error = %e, "Failed to enqueue sync cycle");
                false
            }
        }
    }
}

/// Minutes to evaluate for a tick at `now`: each skipped minute (at its
/// start) followed by `now` itself. Empty when `now` falls in a minute that
/// was already evaluated.
fn minutes_since(cursor: &Mutex<Option<i64>>, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let current = now.timestamp().div_euclid(60);
    let mut cursor = cursor.lock();
    let first = match *cursor {
        Some(last) if current <= last => return Vec::new(),
        Some(last) => (last + 1).max(current - MAX_CATCH_UP_MINUTES),
        None => current,
    };
    *cursor = Some(current);

    let mut minutes: Vec<DateTime<Utc>> = (first..current)
        .filter_map(|minute| DateTime::from_timestamp(minute * 60, 0))
        .collect();
    if first < current {
        debug!(skipped = current - first, "Replaying skipped scheduler minutes");
    }
    minutes.push(now);
    minutes
}

/// Time from `now` until `MINUTE_TICK_OFFSET` past the next minute boundary.
fn delay_to_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = Duration::from_millis(now.timestamp_millis().rem_euclid(60_000) as u64);
    MINUTE.saturating_sub(into_minute) + MINUTE_TICK_OFFSET
}

fn minute_aligned_interval() -> tokio::time::Interval {
    let start = Instant::now() + delay_to_next_minute(Utc::now());
    let mut ticker = interval_at(start, MINUTE);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn trigger_payload(cadence: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("trigger".to_string(), Value::String("time_scheduler".to_string()));
    payload.insert("cadence".to_string(), Value::String(cadence.to_string()));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::market_hours::{FixedIntervalDetector, PRIMARY_MARKET_SYNC_INTERVAL};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse::<DateTime<Utc>>().unwrap()
    }

    fn scheduler_with(detector: Option<Arc<dyn MarketStateDetector>>) -> (Arc<JobManager>, TimeScheduler) {
        let manager = Arc::new(JobManager::new());
        let mut scheduler = TimeScheduler::new(manager.clone());
        if let Some(detector) = detector {
            scheduler = scheduler.with_detector(detector);
        }
        (manager, scheduler)
    }

    #[test]
    fn test_market_sync_aligns_to_interval() {
        let (manager, scheduler) =
            scheduler_with(Some(Arc::new(FixedIntervalDetector::new(PRIMARY_MARKET_SYNC_INTERVAL))));

        assert!(scheduler.tick_market_sync_at(at("2026-03-02T14:10:00Z")));
        for minute in 11..15 {
            let now = at(&format!("2026-03-02T14:{}:00Z", minute));
            assert!(!scheduler.tick_market_sync_at(now), "minute {} should not sync", minute);
        }
        assert!(scheduler.tick_market_sync_at(at("2026-03-02T14:15:00Z")));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_market_sync_fires_once_per_minute() {
        let (manager, scheduler) =
            scheduler_with(Some(Arc::new(FixedIntervalDetector::new(PRIMARY_MARKET_SYNC_INTERVAL))));

        assert!(scheduler.tick_market_sync_at(at("2026-03-02T14:10:02Z")));
        assert!(!scheduler.tick_market_sync_at(at("2026-03-02T14:10:45Z")));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_interval_change_within_minute_does_not_double_fire() {
        let interval = Arc::new(Mutex::new(Duration::from_secs(300)));
        let source = interval.clone();
        let detector = move |_now: DateTime<Utc>| *source.lock();
        let (manager, scheduler) = scheduler_with(Some(Arc::new(detector)));

        assert!(scheduler.tick_market_sync_at(at("2026-03-02T14:20:00Z")));
        *interval.lock() = Duration::from_secs(600);
        assert!(!scheduler.tick_market_sync_at(at("2026-03-02T14:20:30Z")));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_closed_markets_never_sync() {
        let (manager, scheduler) =
            scheduler_with(Some(Arc::new(FixedIntervalDetector::new(Duration::ZERO))));

        for minute in 0..60 {
            let now = at(&format!("2026-03-02T22:{:02}:00Z", minute));
            assert!(!scheduler.tick_market_sync_at(now));
        }
        assert!(manager.is_empty());
    }

    #[test]
    fn test_fallback_interval_without_detector() {
        let (manager, scheduler) = scheduler_with(None);
        let scheduler = scheduler.with_fallback_sync_interval(Duration::from_secs(15 * 60));

        assert!(scheduler.tick_market_sync_at(at("2026-03-02T03:00:00Z")));
        assert!(!scheduler.tick_market_sync_at(at("2026-03-02T03:05:00Z")));
        assert!(scheduler.tick_market_sync_at(at("2026-03-02T03:15:00Z")));

        let job = manager.try_dequeue_at(at("2026-03-02T03:20:00Z")).unwrap();
        assert_eq!(job.job_type, JobType::SYNC_CYCLE);
        assert_eq!(job.priority(), Priority::High);
    }

    #[test]
    fn test_calendar_cadences() {
        let (manager, scheduler) = scheduler_with(None);

        // 2026-03-01 is a Sunday and the first of the month
        assert_eq!(
            scheduler.tick_calendar_at(at("2026-03-01T01:00:00Z")),
            vec![JobType::DAILY_BACKUP]
        );
        assert_eq!(
            scheduler.tick_calendar_at(at("2026-03-01T01:30:00Z")),
            vec![JobType::WEEKLY_BACKUP]
        );
        assert_eq!(
            scheduler.tick_calendar_at(at("2026-03-01T02:30:00Z")),
            vec![JobType::MONTHLY_BACKUP]
        );
        // Monday: no weekly backup, not the first: no monthly backup
        assert!(scheduler.tick_calendar_at(at("2026-03-02T01:30:00Z")).is_empty());
        assert!(scheduler.tick_calendar_at(at("2026-03-02T02:30:00Z")).is_empty());
        assert!(scheduler.tick_calendar_at(at("2026-03-02T01:01:00Z")).is_empty());
        assert_eq!(manager.len(), 3);
    }

    #[test]
    fn test_calendar_matching_minute_fires_once() {
        let (manager, scheduler) = scheduler_with(None);

        assert_eq!(scheduler.tick_calendar_at(at("2026-03-02T02:00:00Z")).len(), 1);
        assert!(scheduler.tick_calendar_at(at("2026-03-02T02:00:59Z")).is_empty());
        assert_eq!(manager.len(), 1);

        // Next day the gate is open again
        assert_eq!(scheduler.tick_calendar_at(at("2026-03-03T02:00:00Z")).len(), 1);
    }

    #[test]
    fn test_late_tick_replays_skipped_calendar_minute() {
        let (manager, scheduler) = scheduler_with(None);

        assert!(scheduler.catch_up_calendar_at(at("2026-03-02T01:59:59.995Z")).is_empty());
        // 02:00 was stepped over by a drifting ticker
        assert_eq!(
            scheduler.catch_up_calendar_at(at("2026-03-02T02:01:00.005Z")),
            vec![JobType::DAILY_MAINTENANCE]
        );
        assert!(scheduler.catch_up_calendar_at(at("2026-03-02T02:01:30Z")).is_empty());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_catch_up_is_bounded() {
        let (manager, scheduler) = scheduler_with(None);

        scheduler.catch_up_calendar_at(at("2026-03-02T00:00:30Z"));
        // Hours later only the last few minutes are replayed, 01:00 and 02:00 are not
        assert!(scheduler.catch_up_calendar_at(at("2026-03-02T02:58:10Z")).is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_late_tick_replays_skipped_market_sync_minute() {
        let (manager, scheduler) =
            scheduler_with(Some(Arc::new(FixedIntervalDetector::new(PRIMARY_MARKET_SYNC_INTERVAL))));

        assert!(!scheduler.catch_up_market_sync_at(at("2026-03-02T14:09:59.995Z")));
        // 14:10 is a sync slot that the late tick skipped
        assert!(scheduler.catch_up_market_sync_at(at("2026-03-02T14:11:00.005Z")));
        assert!(!scheduler.catch_up_market_sync_at(at("2026-03-02T14:11:40Z")));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_minute_loops_align_to_wall_clock() {
        assert_eq!(
            delay_to_next_minute(at("2026-03-02T14:09:59.995Z")),
            Duration::from_millis(5) + MINUTE_TICK_OFFSET
        );
        assert_eq!(
            delay_to_next_minute(at("2026-03-02T14:10:00Z")),
            MINUTE + MINUTE_TICK_OFFSET
        );
        assert_eq!(
            delay_to_next_minute(at("2026-03-02T14:10:20Z")),
            Duration::from_secs(40) + MINUTE_TICK_OFFSET
        );
    }

    #[test]
    fn test_deployment_interval_gate() {
        let (_manager, scheduler) = scheduler_with(None);
        let scheduler = scheduler.with_schedule(ScheduleTable::empty());
        scheduler.set_deployment_interval(Some(Duration::from_secs(5 * 60)));

        assert_eq!(scheduler.tick_calendar_at(at("2026-03-02T10:00:00Z")), vec![JobType::DEPLOYMENT]);
        assert!(scheduler.tick_calendar_at(at("2026-03-02T10:01:00Z")).is_empty());
        assert!(scheduler.tick_calendar_at(at("2026-03-02T10:04:00Z")).is_empty());
        // Ticker jitter: 4m58s after the last one still counts
        assert_eq!(scheduler.tick_calendar_at(at("2026-03-02T10:04:58Z")), vec![JobType::DEPLOYMENT]);

        scheduler.set_deployment_interval(None);
        assert!(scheduler.tick_calendar_at(at("2026-03-02T11:00:00Z")).is_empty());
    }

    #[test]
    fn test_hourly_tick_gates_per_hour() {
        let (manager, scheduler) = scheduler_with(None);

        assert_eq!(
            scheduler.tick_hourly_at(at("2026-03-02T10:17:00Z")),
            vec![JobType::HOURLY_BACKUP, JobType::HEALTH_CHECK]
        );
        assert!(scheduler.tick_hourly_at(at("2026-03-02T10:47:00Z")).is_empty());
        assert_eq!(scheduler.tick_hourly_at(at("2026-03-02T11:16:58Z")).len(), 2);
        assert_eq!(manager.len(), 4);
    }

    #[test]
    fn test_scheduled_job_types_include_sync() {
        let (_manager, scheduler) = scheduler_with(None);
        let types = scheduler.scheduled_job_types();
        assert!(types.contains(&JobType::SYNC_CYCLE));
        assert!(types.contains(&JobType::HOURLY_BACKUP));
        assert!(!types.contains(&JobType::DEPLOYMENT));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins_loops() {
        let (manager, scheduler) = scheduler_with(None);
        let scheduler = Arc::new(scheduler.with_schedule(ScheduleTable {
            calendar: Vec::new(),
            hourly: vec![(JobType::HOURLY_BACKUP, Priority::Medium)],
        }));

        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());

        // Hourly loop fires immediately on start
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());

        let after_stop = manager.len();
        assert!(after_stop >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.len(), after_stop);

        // Second stop is a no-op
        scheduler.stop().await;

        // Restart gets a fresh token
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }
}
