use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use crate::models::{Event, JobProgressInfo, JobStatus, JobStatusData, JobType};
use crate::services::event_bus::EventBus;

/// Default minimum gap between throttled progress events (10 updates/sec).
pub const DEFAULT_PROGRESS_THROTTLE: Duration = Duration::from_millis(100);

const MODULE: &str = "queue";

/// Streams `JOB_PROGRESS` events for one job run.
///
/// Throttled calls emit only when `min_interval` has passed since the last
/// emission, or when `current == total` for a determinate update. The
/// unthrottled variants always emit and still reset the throttle clock.
///
/// Safe to share across tasks/threads within a handler. Without a bus every
/// call is a no-op.
pub struct ProgressReporter {
    bus: Option<EventBus>,
    job_id: String,
    job_type: JobType,
    min_interval: Duration,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new(bus: Option<EventBus>, job_id: impl Into<String>, job_type: JobType) -> Self {
        Self::with_min_interval(bus, job_id, job_type, DEFAULT_PROGRESS_THROTTLE)
    }

    pub fn with_min_interval(
        bus: Option<EventBus>,
        job_id: impl Into<String>,
        job_type: JobType,
        min_interval: Duration,
    ) -> Self {
        Self {
            bus,
            job_id: job_id.into(),
            job_type,
            min_interval,
            last_emit: Mutex::new(None),
        }
    }

    /// Reporter that never emits, for handlers run outside the worker pool.
    pub fn disabled(job_type: JobType) -> Self {
        Self::new(None, "", job_type)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn report(&self, current: u64, total: u64, message: &str) {
        let complete = total > 0 && current == total;
        if self.acquire_slot(complete) {
            self.emit(progress_info(current, total, message, None, None, None));
        }
    }

    pub fn report_with_details(
        &self,
        current: u64,
        total: u64,
        message: &str,
        phase: &str,
        sub_phase: &str,
        details: Option<Map<String, Value>>,
    ) {
        let complete = total > 0 && current == total;
        if self.acquire_slot(complete) {
            self.emit(progress_info(current, total, message, Some(phase), Some(sub_phase), details));
        }
    }

    /// Milestones and phase transitions that must not be dropped.
    pub fn report_unthrottled(&self, current: u64, total: u64, message: &str) {
        if self.acquire_slot(true) {
            self.emit(progress_info(current, total, message, None, None, None));
        }
    }

    pub fn report_unthrottled_with_details(
        &self,
        current: u64,
        total: u64,
        message: &str,
        phase: &str,
        sub_phase: &str,
        details: Option<Map<String, Value>>,
    ) {
        if self.acquire_slot(true) {
            self.emit(progress_info(current, total, message, Some(phase), Some(sub_phase), details));
        }
    }

    /// Indeterminate progress (0/0). Throttled, with no completion bypass.
    pub fn report_message(&self, message: &str) {
        if self.acquire_slot(false) {
            self.emit(progress_info(0, 0, message, None, None, None));
        }
    }

    /// Checks and advances the throttle clock under one lock so concurrent
    /// callers cannot both pass the same window.
    fn acquire_slot(&self, bypass: bool) -> bool {
        if self.bus.is_none() {
            return false;
        }

        let mut last_emit = self.last_emit.lock();
        let now = Instant::now();
        let due = match *last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };

        if bypass || due {
            *last_emit = Some(now);
            true
        } else {
            false
        }
    }

    fn emit(&self, progress: JobProgressInfo) {
        let Some(bus) = &self.bus else {
            return;
        };

        let mut data = JobStatusData::new(
            &self.job_id,
            self.job_type.as_str(),
            self.job_type.description(),
            JobStatus::Progress,
        );
        data.progress = Some(progress);
        bus.publish(Event::job_status(MODULE, data));
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("min_interval", &self.min_interval)
            .field("enabled", &self.bus.is_some())
            .finish()
    }
}

fn progress_info(
    current: u64,
    total: u64,
    message: &str,
    phase: Option<&str>,
    sub_phase: Option<&str>,
    details: Option<Map<String, Value>>,
) -> JobProgressInfo {
    let non_empty = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
    JobProgressInfo {
        current,
        total,
        message: message.to_string(),
        phase: non_empty(phase),
        sub_phase: non_empty(sub_phase),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn capture(bus: &EventBus) -> Arc<Mutex<Vec<JobStatusData>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe(EventType::JobProgress, move |event| {
            if let Some(data) = event.job_status_data() {
                sink.lock().push(data.clone());
            }
        });
        events
    }

    #[test]
    fn test_new_reporter_defaults() {
        let reporter = ProgressReporter::new(None, "test_job_123", JobType::PLANNER_BATCH);
        assert_eq!(reporter.job_id(), "test_job_123");
        assert_eq!(reporter.job_type(), &JobType::PLANNER_BATCH);
        assert_eq!(reporter.min_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_report_emits_job_status_data() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = ProgressReporter::new(Some(bus), "test_job_456", JobType::SYNC_CYCLE);

        reporter.report(3, 7, "Syncing portfolio");

        let events = events.lock();
        assert_eq!(events.len(), 1);
        let data = &events[0];
        assert_eq!(data.job_id, "test_job_456");
        assert_eq!(data.job_type, "sync_cycle");
        assert_eq!(data.status, JobStatus::Progress);
        assert_eq!(data.description, "Syncing all data from broker");
        let progress = data.progress.as_ref().unwrap();
        assert_eq!((progress.current, progress.total), (3, 7));
        assert_eq!(progress.message, "Syncing portfolio");
    }

    #[test]
    fn test_rapid_reports_are_throttled_but_completion_bypasses() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = ProgressReporter::new(Some(bus), "test_job_789", JobType::DIVIDEND_REINVESTMENT);

        reporter.report(1, 10, "Step 1");
        thread::sleep(Duration::from_millis(10));
        reporter.report(2, 10, "Step 2");
        thread::sleep(Duration::from_millis(10));
        reporter.report(3, 10, "Step 3");
        assert_eq!(events.lock().len(), 1);
        assert_eq!(events.lock()[0].progress.as_ref().unwrap().message, "Step 1");

        reporter.report(10, 10, "Complete");
        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].progress.as_ref().unwrap().current, 10);
    }

    #[test]
    fn test_report_allowed_again_after_interval() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = ProgressReporter::with_min_interval(
            Some(bus),
            "test_interval",
            JobType::SYNC_PRICES,
            Duration::from_millis(20),
        );

        reporter.report(1, 10, "Step 1");
        reporter.report(2, 10, "Step 2");
        thread::sleep(Duration::from_millis(40));
        reporter.report(4, 10, "Step 4");

        let currents: Vec<u64> = events
            .lock()
            .iter()
            .map(|d| d.progress.as_ref().unwrap().current)
            .collect();
        assert_eq!(currents, vec![1, 4]);
    }

    #[test]
    fn test_message_reports_have_no_completion_bypass() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = ProgressReporter::new(Some(bus), "test_throttle_msg", JobType::HISTORY_CLEANUP);

        reporter.report_message("Message 1");
        reporter.report_message("Message 2");

        let events = events.lock();
        assert_eq!(events.len(), 1);
        let progress = events[0].progress.as_ref().unwrap();
        assert!(progress.is_indeterminate());
        assert_eq!(progress.message, "Message 1");
    }

    #[test]
    fn test_unthrottled_reports_always_emit_and_reset_clock() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = ProgressReporter::new(Some(bus), "test_unthrottled", JobType::PLANNER_BATCH);

        reporter.report(1, 10, "Step 1");
        reporter.report_unthrottled(5, 10, "Milestone 50%");
        reporter.report_unthrottled(7, 10, "Milestone 70%");
        // Measured from the last unthrottled emission
        reporter.report(8, 10, "Step 8");

        let messages: Vec<String> = events
            .lock()
            .iter()
            .map(|d| d.progress.as_ref().unwrap().message.clone())
            .collect();
        assert_eq!(messages, vec!["Step 1", "Milestone 50%", "Milestone 70%"]);
    }

    #[test]
    fn test_report_with_details_carries_phases() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = ProgressReporter::new(Some(bus), "test_job_details", JobType::PLANNER_BATCH);

        let mut details = Map::new();
        details.insert("workers_active".into(), json!(4));
        details.insert("best_score".into(), json!(0.847));
        reporter.report_with_details(
            847,
            2500,
            "Evaluating sequences",
            "sequence_evaluation",
            "batch_1",
            Some(details),
        );
        reporter.report_unthrottled_with_details(
            2500,
            2500,
            "Evaluation complete",
            "sequence_evaluation",
            "",
            None,
        );

        let events = events.lock();
        assert_eq!(events.len(), 2);
        let first = events[0].progress.as_ref().unwrap();
        assert_eq!(first.phase.as_deref(), Some("sequence_evaluation"));
        assert_eq!(first.sub_phase.as_deref(), Some("batch_1"));
        assert_eq!(first.details.as_ref().unwrap()["best_score"], json!(0.847));

        let second = events[1].progress.as_ref().unwrap();
        assert_eq!(second.sub_phase, None);
        assert!(second.details.is_none());
    }

    #[test]
    fn test_without_bus_is_a_no_op() {
        let reporter = ProgressReporter::disabled(JobType::DEPLOYMENT);
        reporter.report(1, 5, "Step 1");
        reporter.report_message("Test message");
        reporter.report_unthrottled(5, 5, "Done");
    }

    #[test]
    fn test_concurrent_reports_are_throttled() {
        let bus = EventBus::new();
        let events = capture(&bus);
        let reporter = Arc::new(ProgressReporter::new(
            Some(bus),
            "test_concurrent",
            JobType::SYNC_PRICES,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reporter = reporter.clone();
                thread::spawn(move || {
                    for j in 0..5 {
                        reporter.report(j, 50, "Concurrent report");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let emitted = events.lock().len();
        assert!(emitted >= 1);
        assert!(emitted < 40, "throttle let {} of 40 reports through", emitted);
    }
}
