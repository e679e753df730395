use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Opaque key/value map handed to a job handler. The engine never looks inside.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Default retry budget for jobs that do not set one explicitly.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

// ==============================================================================
// Job Type
// ==============================================================================

/// String tag identifying a kind of job.
///
/// The catalog below covers the job types the backend schedules itself, but
/// any string is accepted: the engine only uses the tag for handler lookup,
/// cadence bookkeeping and descriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(Cow<'static, str>);

impl JobType {
    // Sync family
    pub const SYNC_CYCLE: JobType = JobType::from_static("sync_cycle");
    pub const SYNC_TRADES: JobType = JobType::from_static("sync_trades");
    pub const SYNC_CASH_FLOWS: JobType = JobType::from_static("sync_cash_flows");
    pub const SYNC_PORTFOLIO: JobType = JobType::from_static("sync_portfolio");
    pub const SYNC_PRICES: JobType = JobType::from_static("sync_prices");
    pub const SYNC_EXCHANGE_RATES: JobType = JobType::from_static("sync_exchange_rates");
    pub const RETRY_TRADES: JobType = JobType::from_static("retry_trades");

    // Planning family
    pub const PLANNER_BATCH: JobType = JobType::from_static("planner_batch");
    pub const EVENT_BASED_TRADING: JobType = JobType::from_static("event_based_trading");
    pub const TAG_UPDATE: JobType = JobType::from_static("tag_update");
    pub const FORMULA_DISCOVERY: JobType = JobType::from_static("formula_discovery");
    pub const ADAPTIVE_MARKET_CHECK: JobType = JobType::from_static("adaptive_market_check");

    // Dividend family
    pub const DIVIDEND_REINVESTMENT: JobType = JobType::from_static("dividend_reinvestment");

    // Health family
    pub const HEALTH_CHECK: JobType = JobType::from_static("health_check");
    pub const CHECK_CORE_DATABASES: JobType = JobType::from_static("check_core_databases");
    pub const CHECK_WAL_CHECKPOINTS: JobType = JobType::from_static("check_wal_checkpoints");
    pub const DEPLOYMENT: JobType = JobType::from_static("deployment");

    // Backup and maintenance family
    pub const HOURLY_BACKUP: JobType = JobType::from_static("hourly_backup");
    pub const DAILY_BACKUP: JobType = JobType::from_static("daily_backup");
    pub const WEEKLY_BACKUP: JobType = JobType::from_static("weekly_backup");
    pub const MONTHLY_BACKUP: JobType = JobType::from_static("monthly_backup");
    pub const DAILY_MAINTENANCE: JobType = JobType::from_static("daily_maintenance");
    pub const WEEKLY_MAINTENANCE: JobType = JobType::from_static("weekly_maintenance");
    pub const MONTHLY_MAINTENANCE: JobType = JobType::from_static("monthly_maintenance");
    pub const HISTORY_CLEANUP: JobType = JobType::from_static("history_cleanup");
    pub const RECOMMENDATION_GC: JobType = JobType::from_static("recommendation_gc");
    pub const CLIENT_DATA_CLEANUP: JobType = JobType::from_static("client_data_cleanup");

    pub const fn from_static(tag: &'static str) -> Self {
        JobType(Cow::Borrowed(tag))
    }

    pub fn new(tag: impl Into<String>) -> Self {
        JobType(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-readable description used in job status events.
    /// Unknown tags describe themselves.
    pub fn description(&self) -> &str {
        match self.as_str() {
            "sync_cycle" => "Syncing all data from broker",
            "sync_trades" => "Syncing trades from broker",
            "sync_cash_flows" => "Syncing cash flows from broker",
            "sync_portfolio" => "Syncing portfolio positions",
            "sync_prices" => "Updating security prices",
            "sync_exchange_rates" => "Updating exchange rates",
            "retry_trades" => "Retrying pending trades",
            "planner_batch" => "Generating trading recommendations",
            "event_based_trading" => "Executing recommended trades",
            "tag_update" => "Updating security tags",
            "formula_discovery" => "Discovering scoring formulas",
            "adaptive_market_check" => "Checking market regime",
            "dividend_reinvestment" => "Reinvesting dividends",
            "health_check" => "Checking system health",
            "check_core_databases" => "Checking core databases",
            "check_wal_checkpoints" => "Checking database WAL checkpoints",
            "deployment" => "Checking for deployments",
            "hourly_backup" => "Creating hourly backup",
            "daily_backup" => "Creating daily backup",
            "weekly_backup" => "Creating weekly backup",
            "monthly_backup" => "Creating monthly backup",
            "daily_maintenance" => "Running daily maintenance",
            "weekly_maintenance" => "Running weekly maintenance",
            "monthly_maintenance" => "Running monthly maintenance",
            "history_cleanup" => "Cleaning up job history",
            "recommendation_gc" => "Removing stale recommendations",
            "client_data_cleanup" => "Cleaning up cached client data",
            other => other,
        }
    }

    /// Priority used when a job of this type is triggered manually.
    pub fn default_priority(&self) -> Priority {
        match self.as_str() {
            "planner_batch" | "event_based_trading" => Priority::Critical,
            "sync_cycle" | "sync_trades" | "sync_cash_flows" | "sync_portfolio" | "sync_prices"
            | "sync_exchange_rates" | "retry_trades" | "dividend_reinvestment" => Priority::High,
            "hourly_backup" | "daily_backup" | "weekly_backup" | "monthly_backup" | "deployment" => {
                Priority::Medium
            }
            _ => Priority::Low,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        JobType::new(value)
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        JobType::new(value)
    }
}

// ==============================================================================
// Priority
// ==============================================================================

/// Dequeue precedence. Declaration order defines `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("Invalid priority: {}", other)),
        }
    }
}

// ==============================================================================
// Job
// ==============================================================================

/// A unit of deferred work.
///
/// `priority` is fixed once the job is built; re-prioritizing means building
/// a new job. `available_at` never precedes `created_at`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    priority: Priority,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
}

impl Job {
    pub fn new(job_type: JobType, priority: Priority, payload: Payload) -> Self {
        Self::new_at(job_type, priority, payload, Utc::now())
    }

    /// Builds a job as if it had been created at `now`.
    pub fn new_at(job_type: JobType, priority: Priority, payload: Payload, now: DateTime<Utc>) -> Self {
        Self {
            id: next_job_id(&job_type, now),
            job_type,
            priority,
            payload,
            created_at: now,
            available_at: now,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defers eligibility by `delay` from creation time.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.available_at = add_duration(self.created_at, delay);
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn available_at(&self) -> DateTime<Utc> {
        self.available_at
    }

    /// Moves eligibility to `at`, clamped so it never precedes creation.
    pub fn set_available_at(&mut self, at: DateTime<Utc>) {
        self.available_at = at.max(self.created_at);
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.available_at
    }

    /// True once a failed attempt has used up the retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retries > self.max_retries
    }
}

fn next_job_id(job_type: &JobType, now: DateTime<Utc>) -> String {
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", job_type, nanos, seq)
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `at + duration`, saturating at the far future.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
