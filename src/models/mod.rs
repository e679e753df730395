pub mod event;
pub mod job;

pub use event::{
    DividendDetectedData, Event, EventData, EventType, JobProgressInfo, JobStatus, JobStatusData,
    PortfolioChangedData, PriceUpdatedData, RecommendationsReadyData, StateChangedData,
};
pub use job::{Job, JobType, Payload, Priority, DEFAULT_MAX_RETRIES};
