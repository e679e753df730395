use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ==============================================================================
// Event Types
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    StateChanged,
    RecommendationsReady,
    DividendDetected,
    PortfolioChanged,
    PriceUpdated,
    ErrorOccurred,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobStarted => "JOB_STARTED",
            EventType::JobProgress => "JOB_PROGRESS",
            EventType::JobCompleted => "JOB_COMPLETED",
            EventType::JobFailed => "JOB_FAILED",
            EventType::StateChanged => "STATE_CHANGED",
            EventType::RecommendationsReady => "RECOMMENDATIONS_READY",
            EventType::DividendDetected => "DIVIDEND_DETECTED",
            EventType::PortfolioChanged => "PORTFOLIO_CHANGED",
            EventType::PriceUpdated => "PRICE_UPDATED",
            EventType::ErrorOccurred => "ERROR_OCCURRED",
        }
    }

    pub fn is_job_lifecycle(&self) -> bool {
        matches!(
            self,
            EventType::JobStarted | EventType::JobProgress | EventType::JobCompleted | EventType::JobFailed
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// Job Status Payloads
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Progress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn event_type(&self) -> EventType {
        match self {
            JobStatus::Started => EventType::JobStarted,
            JobStatus::Progress => EventType::JobProgress,
            JobStatus::Completed => EventType::JobCompleted,
            JobStatus::Failed => EventType::JobFailed,
        }
    }
}

/// Progress snapshot of a running job.
///
/// `total == 0` means indeterminate progress. `phase` and `sub_phase` label
/// multi-stage jobs (e.g. `sequence_evaluation` / `batch_1`); `details` holds
/// free-form metrics for the current phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgressInfo {
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl JobProgressInfo {
    pub fn is_indeterminate(&self) -> bool {
        self.total == 0
    }
}

/// Payload of every job lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusData {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgressInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl JobStatusData {
    pub fn new(job_id: &str, job_type: &str, description: &str, status: JobStatus) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            status,
            description: description.to_string(),
            progress: None,
            error: None,
            duration: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }
}

// ==============================================================================
// Domain Event Payloads
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateChangedData {
    #[serde(default)]
    pub old_hash: String,
    #[serde(default)]
    pub new_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationsReadyData {
    #[serde(default)]
    pub portfolio_hash: String,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DividendDetectedData {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioChangedData {
    #[serde(default)]
    pub sync_completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdatedData {
    #[serde(default)]
    pub prices_synced: bool,
}

/// Typed event payload with a generic map fallback for producers the
/// backend does not know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    JobStatus(JobStatusData),
    StateChanged(StateChangedData),
    RecommendationsReady(RecommendationsReadyData),
    DividendDetected(DividendDetectedData),
    PortfolioChanged(PortfolioChangedData),
    PriceUpdated(PriceUpdatedData),
    Generic(Map<String, Value>),
}

impl EventData {
    /// Decodes `value` into the variant matching `event_type`.
    ///
    /// Unknown fields are ignored. Payloads that do not fit the typed
    /// variant are kept as a generic map instead of being rejected.
    pub fn from_json(event_type: EventType, value: Value) -> Self {
        fn typed<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
            serde_json::from_value(value.clone()).ok()
        }

        let decoded = match event_type {
            t if t.is_job_lifecycle() => typed(&value).map(EventData::JobStatus),
            EventType::StateChanged => typed(&value).map(EventData::StateChanged),
            EventType::RecommendationsReady => typed(&value).map(EventData::RecommendationsReady),
            EventType::DividendDetected => typed(&value).map(EventData::DividendDetected),
            EventType::PortfolioChanged => typed(&value).map(EventData::PortfolioChanged),
            EventType::PriceUpdated => typed(&value).map(EventData::PriceUpdated),
            _ => None,
        };

        decoded.unwrap_or_else(|| match value {
            Value::Object(map) => EventData::Generic(map),
            Value::Null => EventData::Generic(Map::new()),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                EventData::Generic(map)
            }
        })
    }

    pub fn as_job_status(&self) -> Option<&JobStatusData> {
        match self {
            EventData::JobStatus(data) => Some(data),
            _ => None,
        }
    }
}

// ==============================================================================
// Event
// ==============================================================================

/// Immutable fact broadcast on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub module: String,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, module: impl Into<String>, data: EventData) -> Self {
        Self {
            event_type,
            module: module.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Lifecycle event whose type follows the status field.
    pub fn job_status(module: impl Into<String>, data: JobStatusData) -> Self {
        Self::new(data.status.event_type(), module, EventData::JobStatus(data))
    }

    pub fn job_status_data(&self) -> Option<&JobStatusData> {
        self.data.as_job_status()
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default)]
    module: String,
    #[serde(default)]
    data: Value,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawEvent::deserialize(deserializer)?;
        Ok(Event {
            event_type: raw.event_type,
            module: raw.module,
            data: EventData::from_json(raw.event_type, raw.data),
            timestamp: raw.timestamp,
        })
    }
}
