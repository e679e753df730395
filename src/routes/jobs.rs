use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, QueueError};
use crate::models::{Job, JobType, Payload, Priority};
use crate::services::job_history::{JobRun, JobRunStats};
use crate::services::job_queue::QueueStats;
use crate::services::worker_pool::{HandlerInfo, WorkerPoolStats};
use crate::state::AppState;

const DEFAULT_RECENT_LIMIT: usize = 50;
const HISTORY_LIMIT: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/queue", get(queue_stats))
        .route("/recent", get(recent_job_runs))
        .route("/:job_type/history", get(job_history))
        .route("/:job_type/stats", get(job_stats))
        .route("/:job_type/run", post(run_job))
}

#[derive(Serialize)]
struct QueueOverview {
    queue: QueueStats,
    workers: WorkerPoolStats,
}

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RunJobRequest {
    priority: Option<Priority>,
    #[serde(default)]
    payload: Payload,
    max_retries: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunJobResponse {
    job_id: String,
    job_type: JobType,
    priority: Priority,
}

/// GET /api/jobs - List registered job handlers
async fn list_jobs(State(state): State<AppState>) -> Json<Vec<HandlerInfo>> {
    Json(state.registry.describe())
}

/// GET /api/jobs/queue - Queue depth and worker status
async fn queue_stats(State(state): State<AppState>) -> Json<QueueOverview> {
    Json(QueueOverview {
        queue: state.manager.stats(),
        workers: state.pool.stats(),
    })
}

/// GET /api/jobs/recent - Most recent finished job runs
async fn recent_job_runs(
    Query(query): Query<RecentQuery>,
    State(state): State<AppState>,
) -> Json<Vec<JobRun>> {
    Json(state.history.recent(query.limit.unwrap_or(DEFAULT_RECENT_LIMIT)))
}

/// GET /api/jobs/:job_type/history - Finished runs for one job type
async fn job_history(
    Path(job_type): Path<String>,
    State(state): State<AppState>,
) -> Json<Vec<JobRun>> {
    Json(state.history.for_type(&job_type, HISTORY_LIMIT))
}

/// GET /api/jobs/:job_type/stats - Success/failure counts for one job type
async fn job_stats(
    Path(job_type): Path<String>,
    State(state): State<AppState>,
) -> Json<JobRunStats> {
    Json(state.history.stats(&job_type))
}

/// POST /api/jobs/:job_type/run - Enqueue a job immediately, ignoring its cadence
async fn run_job(
    Path(job_type): Path<String>,
    State(state): State<AppState>,
    request: Option<Json<RunJobRequest>>,
) -> Result<(StatusCode, Json<RunJobResponse>), AppError> {
    let job_type = JobType::new(job_type);
    if !state.registry.contains(&job_type) {
        return Err(QueueError::UnknownJobType(job_type.to_string()).into());
    }

    let request = request.map(|Json(body)| body).unwrap_or_default();
    let priority = request.priority.unwrap_or_else(|| job_type.default_priority());
    let mut payload = request.payload;
    payload.insert("trigger".to_string(), serde_json::Value::from("manual"));

    let job = Job::new(job_type.clone(), priority, payload).with_max_retries(
        request
            .max_retries
            .unwrap_or_else(|| state.manager.default_max_retries()),
    );
    let job_id = job.id.clone();
    state.manager.enqueue(job)?;

    info!(job_id = %job_id, job_type = %job_type, priority = %priority, "POST /api/jobs/:job_type/run - Job triggered manually");

    Ok((
        StatusCode::ACCEPTED,
        Json(RunJobResponse {
            job_id,
            job_type,
            priority,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::state::AppState;

    fn state_with_sync_handler() -> AppState {
        let state = AppState::from_config(&EngineConfig::default());
        state
            .registry
            .register_fn(JobType::SYNC_CYCLE, |_payload, _progress| async { Ok(()) });
        state
    }

    #[tokio::test]
    async fn test_run_job_uses_default_priority() {
        let state = state_with_sync_handler();

        let (status, Json(response)) = run_job(Path("sync_cycle".to_string()), State(state.clone()), None)
            .await
            .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(response.priority, Priority::High);
        let job = state.manager.try_dequeue().unwrap();
        assert_eq!(job.id, response.job_id);
        assert_eq!(job.payload["trigger"], "manual");
    }

    #[tokio::test]
    async fn test_run_job_honours_requested_priority() {
        let state = state_with_sync_handler();
        let request = RunJobRequest {
            priority: Some(Priority::Low),
            max_retries: Some(0),
            ..RunJobRequest::default()
        };

        let (_, Json(response)) = run_job(
            Path("sync_cycle".to_string()),
            State(state.clone()),
            Some(Json(request)),
        )
        .await
        .unwrap();

        assert_eq!(response.priority, Priority::Low);
        assert_eq!(state.manager.try_dequeue().unwrap().max_retries, 0);
    }

    #[tokio::test]
    async fn test_run_job_rejects_unregistered_type() {
        let state = AppState::from_config(&EngineConfig::default());
        let result = run_job(Path("nope".to_string()), State(state.clone()), None).await;

        assert!(matches!(result, Err(AppError::Queue(QueueError::UnknownJobType(_)))));
        assert!(state.manager.is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_and_queue_stats() {
        let state = state_with_sync_handler();
        let Json(jobs) = list_jobs(State(state.clone())).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::SYNC_CYCLE);

        run_job(Path("sync_cycle".to_string()), State(state.clone()), None)
            .await
            .unwrap();
        let Json(overview) = queue_stats(State(state)).await;
        assert_eq!(overview.queue.pending, 1);
        assert!(!overview.workers.running);
    }
}
