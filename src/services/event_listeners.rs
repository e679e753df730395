use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{Event, EventType, Job, JobType, Payload, Priority};
use crate::services::event_bus::{EventBus, SubscriptionId};
use crate::services::job_queue::JobManager;

/// How one domain event type turns into a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRule {
    pub event_type: EventType,
    pub job_type: JobType,
    pub priority: Priority,
    pub max_retries: u32,
    /// Drop the event when a job of the same type is already pending.
    pub coalesce: bool,
}

impl ListenerRule {
    pub fn new(event_type: EventType, job_type: JobType, priority: Priority) -> Self {
        Self {
            event_type,
            job_type,
            priority,
            max_retries: crate::models::DEFAULT_MAX_RETRIES,
            coalesce: false,
        }
    }

    pub fn coalescing(mut self) -> Self {
        self.coalesce = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builds the job for `event`. The event's data travels in the payload
    /// under `event` so the handler can inspect what triggered it.
    pub fn job_for(&self, event: &Event) -> Job {
        let mut payload = Payload::new();
        payload.insert("trigger".to_string(), Value::String(event.event_type.to_string()));
        payload.insert("source_module".to_string(), Value::String(event.module.clone()));
        if let Ok(data) = serde_json::to_value(&event.data) {
            payload.insert("event".to_string(), data);
        }
        Job::new(self.job_type.clone(), self.priority, payload).with_max_retries(self.max_retries)
    }
}

/// Default event → job translations.
pub fn default_rules(max_retries: u32) -> Vec<ListenerRule> {
    vec![
        ListenerRule::new(EventType::StateChanged, JobType::PLANNER_BATCH, Priority::Critical)
            .coalescing()
            .with_max_retries(max_retries),
        ListenerRule::new(EventType::RecommendationsReady, JobType::EVENT_BASED_TRADING, Priority::Critical)
            .coalescing()
            .with_max_retries(max_retries),
        ListenerRule::new(EventType::DividendDetected, JobType::DIVIDEND_REINVESTMENT, Priority::High)
            .with_max_retries(max_retries),
    ]
}

/// Subscribes one bus callback per rule. Callbacks only translate and
/// enqueue; enqueue failures are logged and never propagate to the publisher.
pub struct EventListeners {
    bus: EventBus,
    rules: Vec<ListenerRule>,
    subscriptions: Vec<SubscriptionId>,
}

impl EventListeners {
    pub fn register(bus: &EventBus, manager: Arc<JobManager>, rules: Vec<ListenerRule>) -> Self {
        let subscriptions = rules
            .iter()
            .cloned()
            .map(|rule| {
                let manager = manager.clone();
                let event_type = rule.event_type;
                bus.subscribe(event_type, move |event| handle_event(&manager, &rule, event))
            })
            .collect();

        info!(rules = rules.len(), "Event listeners registered");

        Self {
            bus: bus.clone(),
            rules,
            subscriptions,
        }
    }

    pub fn rules(&self) -> &[ListenerRule] {
        &self.rules
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.rules.iter().map(|rule| rule.job_type.clone()).collect()
    }

    pub fn unregister(self) {
        for id in &self.subscriptions {
            self.bus.unsubscribe(*id);
        }
    }
}

fn handle_event(manager: &JobManager, rule: &ListenerRule, event: &Event) {
    let job = rule.job_for(event);
    let job_id = job.id.clone();

    let result = if rule.coalesce {
        manager.enqueue_if_absent(job)
    } else {
        manager.enqueue(job).map(|()| true)
    };

    match result {
        Ok(true) => info!(
            event_type = %event.event_type,
            job_id = %job_id,
            job_type = %rule.job_type,
            priority = %rule.priority,
            "Event converted to job"
        ),
        Ok(false) => debug!(
            event_type = %event.event_type,
            job_type = %rule.job_type,
            "Job already pending, event coalesced"
        ),
        Err(e) => warn!(
            event_type = %event.event_type,
            job_id = %job_id,
            job_type = %rule.job_type,
            error = %e,
            "Failed to enqueue job for event"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DividendDetectedData, EventData, StateChangedData};

    fn state_changed() -> Event {
        Event::new(
            EventType::StateChanged,
            "portfolio",
            EventData::StateChanged(StateChangedData {
                old_hash: "abc".into(),
                new_hash: "def".into(),
            }),
        )
    }

    #[test]
    fn test_state_changed_enqueues_critical_planner_batch() {
        let bus = EventBus::new();
        let manager = Arc::new(JobManager::new());
        let _listeners = EventListeners::register(&bus, manager.clone(), default_rules(3));

        bus.publish(state_changed());

        let job = manager.try_dequeue().expect("planner batch enqueued");
        assert_eq!(job.job_type, JobType::PLANNER_BATCH);
        assert_eq!(job.priority(), Priority::Critical);
        assert_eq!(job.payload["trigger"], Value::String("STATE_CHANGED".into()));
        assert_eq!(job.payload["event"]["new_hash"], Value::String("def".into()));
    }

    #[test]
    fn test_coalescing_rule_prevents_duplicates() {
        let bus = EventBus::new();
        let manager = Arc::new(JobManager::new());
        let _listeners = EventListeners::register(&bus, manager.clone(), default_rules(3));

        for _ in 0..5 {
            bus.publish(state_changed());
        }
        assert_eq!(manager.len(), 1);

        // Once dequeued, the next event produces a fresh job
        manager.try_dequeue().unwrap();
        bus.publish(state_changed());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_dividends_are_not_coalesced() {
        let bus = EventBus::new();
        let manager = Arc::new(JobManager::new());
        let _listeners = EventListeners::register(&bus, manager.clone(), default_rules(2));

        for symbol in ["AAPL", "MSFT"] {
            bus.emit(
                EventType::DividendDetected,
                "dividends",
                EventData::DividendDetected(DividendDetectedData {
                    symbol: symbol.into(),
                    amount: 1.25,
                    currency: Some("USD".into()),
                }),
            );
        }

        assert_eq!(manager.len(), 2);
        let job = manager.try_dequeue().unwrap();
        assert_eq!(job.job_type, JobType::DIVIDEND_REINVESTMENT);
        assert_eq!(job.priority(), Priority::High);
        assert_eq!(job.max_retries, 2);
    }

    #[test]
    fn test_enqueue_failure_does_not_reach_publisher() {
        let bus = EventBus::new();
        let manager = Arc::new(JobManager::new());
        let _listeners = EventListeners::register(&bus, manager.clone(), default_rules(3));
        manager.close();

        assert_eq!(bus.publish(state_changed()), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_unregister_removes_subscriptions() {
        let bus = EventBus::new();
        let manager = Arc::new(JobManager::new());
        let listeners = EventListeners::register(&bus, manager.clone(), default_rules(3));
        assert_eq!(listeners.job_types().len(), 3);

        listeners.unregister();
        bus.publish(state_changed());
        assert!(manager.is_empty());
        assert_eq!(bus.subscriber_count(EventType::StateChanged), 0);
    }
}
