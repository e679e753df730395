pub mod event_bus;
pub mod event_listeners;
pub mod job_history;
pub mod job_queue;
pub mod market_hours;
pub mod progress_reporter;
pub mod time_scheduler;
pub mod worker_pool;

pub use event_bus::{EventBus, SubscriptionId};
pub use event_listeners::{default_rules, EventListeners, ListenerRule};
pub use job_history::{JobHistory, JobRun, JobRunStats};
pub use job_queue::{JobManager, QueueStats};
pub use market_hours::{FixedIntervalDetector, MarketStateDetector};
pub use progress_reporter::ProgressReporter;
pub use time_scheduler::{CadenceEntry, ScheduleTable, TimeScheduler};
pub use worker_pool::{
    HandlerInfo, HandlerRegistry, JobHandler, JobOutcome, RetryBackoff, WorkerPool, WorkerPoolConfig,
};
