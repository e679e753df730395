use std::sync::Arc;

use crate::config::EngineConfig;
use crate::services::event_bus::EventBus;
use crate::services::job_history::JobHistory;
use crate::services::job_queue::JobManager;
use crate::services::worker_pool::{HandlerRegistry, WorkerPool, WorkerPoolConfig};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub registry: HandlerRegistry,
    pub bus: EventBus,
    pub history: JobHistory,
    pub pool: Arc<WorkerPool>,
}

impl AppState {
    /// Wires the engine components together. Nothing is started.
    pub fn from_config(config: &EngineConfig) -> Self {
        let manager = Arc::new(
            JobManager::new()
                .with_capacity(config.queue_capacity)
                .with_default_max_retries(config.default_max_retries),
        );
        let registry = HandlerRegistry::new();
        let bus = EventBus::new();
        let history = JobHistory::new(config.job_history_capacity);
        history.attach(&bus);
        let pool = Arc::new(WorkerPool::new(
            manager.clone(),
            registry.clone(),
            Some(bus.clone()),
            WorkerPoolConfig::from(config),
        ));

        Self {
            manager,
            registry,
            bus,
            history,
            pool,
        }
    }
}
