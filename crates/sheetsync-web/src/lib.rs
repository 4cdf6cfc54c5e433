//! JSON operator API over the sync engine.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sheetsync_core::{JobKind, JobRunState, LogEntry};
use sheetsync_sync::{SyncEngine, SyncError};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "sheetsync-web";

const DEFAULT_LOG_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: JobKind,
    pub schedule: Vec<String>,
    pub key_column: String,
    pub source_url: String,
    pub destination_url: String,
    pub state: JobRunState,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct AutoView {
    pub enabled: bool,
    pub last_tick: Option<String>,
    pub tick_interval_secs: f64,
}

#[derive(Debug, Deserialize)]
pub struct AutoToggle {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: &'static str,
    job_id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/{id}/run", post(run_job_handler))
        .route("/api/run-all", post(run_all_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/auto", get(auto_status_handler).post(auto_toggle_handler))
        .with_state(Arc::new(state))
}

/// Serve on `0.0.0.0:port` until Ctrl-C, then stop automatic mode.
pub async fn serve(engine: Arc<SyncEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "operator api listening");
    axum::serve(listener, app(AppState::new(engine.clone())))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
            }
        })
        .await?;
    engine.stop_auto().await;
    Ok(())
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JobView>> {
    let jobs = state
        .engine
        .statuses()
        .into_iter()
        .map(|(job, status)| JobView {
            id: job.id.clone(),
            name: job.name.clone(),
            description: job.description.clone(),
            kind: job.kind,
            schedule: job.slots.iter().map(ToString::to_string).collect(),
            key_column: job.key_column.clone(),
            source_url: job.source_url.clone(),
            destination_url: job.destination_url.clone(),
            state: status.state,
            last_run: status.last_run,
        })
        .collect();
    Json(jobs)
}

async fn run_job_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.trigger_exclusive(&id) {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(Accepted {
                accepted: "run",
                job_id: Some(id),
            }),
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn run_all_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.engine.is_auto_mode() {
        return error_response(&SyncError::RunAllDisallowed);
    }
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.run_all().await {
            warn!(error = %err, "run-all refused");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: "run-all",
            job_id: None,
        }),
    )
        .into_response()
}

async fn logs_handler(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(state.engine.log().recent(limit))
}

async fn auto_status_handler(State(state): State<Arc<AppState>>) -> Json<AutoView> {
    Json(auto_view(&state.engine))
}

async fn auto_toggle_handler(State(state): State<Arc<AppState>>, Json(toggle): Json<AutoToggle>) -> Json<AutoView> {
    state.engine.set_auto_mode(toggle.enabled).await;
    Json(auto_view(&state.engine))
}

fn auto_view(engine: &SyncEngine) -> AutoView {
    AutoView {
        enabled: engine.is_auto_mode(),
        last_tick: engine.state().last_tick().map(|slot| slot.to_string()),
        tick_interval_secs: engine.tick_interval().as_secs_f64(),
    }
}

fn error_response(err: &SyncError) -> Response {
    let status = match err {
        SyncError::UnknownJob(_) => StatusCode::NOT_FOUND,
        SyncError::RunAllDisallowed | SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use sheetsync_core::{parse_schedule, Job, Row};
    use sheetsync_fetch::FetchError;
    use sheetsync_sync::{FeedSource, SimulatedWriter};
    use std::time::Duration;
    use tower::ServiceExt;

    struct FixedFeeds;

    #[async_trait]
    impl FeedSource for FixedFeeds {
        async fn fetch_rows(&self, url: &str) -> Result<Vec<Row>, FetchError> {
            let csv = if url.ends_with("/source") {
                "日期,收盤\n2026/03/05,11\n"
            } else {
                ""
            };
            Ok(sheetsync_csv::decode(csv).unwrap())
        }
    }

    fn engine() -> Arc<SyncEngine> {
        engine_with_write_delay(Duration::ZERO)
    }

    fn engine_with_write_delay(delay: Duration) -> Arc<SyncEngine> {
        let jobs = ["job-stock", "job-global"]
            .into_iter()
            .map(|id| Job {
                id: id.into(),
                name: id.to_uppercase(),
                description: format!("{id} feed"),
                kind: if id == "job-global" { JobKind::Global } else { JobKind::Stock },
                source_url: format!("https://sheets.test/{id}/source"),
                destination_url: format!("https://sheets.test/{id}/destination"),
                key_column: "日期".into(),
                slots: parse_schedule(if id == "job-global" { "14:00 & 06:00" } else { "14:00" }).unwrap(),
            })
            .collect();
        Arc::new(
            SyncEngine::new(jobs, Arc::new(FixedFeeds), Arc::new(SimulatedWriter::new(delay)))
                .with_tick_interval(Duration::from_secs(30)),
        )
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn jobs_lists_slots_and_state() {
        let resp = app(AppState::new(engine())).oneshot(get("/api/jobs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let jobs = body_json(resp).await;
        assert_eq!(jobs.as_array().unwrap().len(), 2);
        assert_eq!(jobs[1]["id"], "job-global");
        assert_eq!(jobs[1]["kind"], "global");
        assert_eq!(jobs[1]["schedule"], serde_json::json!(["14:00", "06:00"]));
        assert_eq!(jobs[0]["state"], "idle");
        assert!(jobs[0]["last_run"].is_null());
    }

    #[tokio::test]
    async fn manual_run_is_accepted_and_completes() {
        let engine = engine();
        let app = app(AppState::new(engine.clone()));

        let resp = app.clone().oneshot(post("/api/jobs/job-stock/run")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.state().run_state("job-stock") != JobRunState::Success {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let logs = body_json(app.oneshot(get("/api/logs?limit=1")).await.unwrap()).await;
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["message"], "Appended 1 new rows to JOB-STOCK");
        assert_eq!(logs[0]["severity"], "success");
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let resp = app(AppState::new(engine())).oneshot(post("/api/jobs/nope/run")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn job_in_flight_cannot_be_retriggered() {
        let engine = engine();
        engine.state().set_state("job-stock", JobRunState::Syncing);
        let resp = app(AppState::new(engine)).oneshot(post("/api/jobs/job-stock/run")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn back_to_back_runs_start_only_one() {
        let engine = engine_with_write_delay(Duration::from_millis(200));
        let app = app(AppState::new(engine.clone()));

        let first = app.clone().oneshot(post("/api/jobs/job-stock/run")).await.unwrap();
        let second = app.clone().oneshot(post("/api/jobs/job-stock/run")).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert!(body_json(second).await["error"].as_str().unwrap().contains("already running"));

        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.state().run_state("job-stock") != JobRunState::Success {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let starts = engine
            .log()
            .for_job("job-stock")
            .into_iter()
            .filter(|e| e.message.starts_with("[manual] starting job"))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn run_all_conflicts_with_auto_mode() {
        let engine = engine();
        let app = app(AppState::new(engine.clone()));

        let resp = app.clone().oneshot(post("/api/run-all")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let toggle = Request::builder()
            .method("POST")
            .uri("/api/auto")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"enabled":true}"#))
            .unwrap();
        let auto = body_json(app.clone().oneshot(toggle).await.unwrap()).await;
        assert_eq!(auto["enabled"], true);
        assert_eq!(auto["tick_interval_secs"], 30.0);

        let resp = app.clone().oneshot(post("/api/run-all")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.state().last_tick().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let status = body_json(app.oneshot(get("/api/auto")).await.unwrap()).await;
        assert_eq!(status["enabled"], true);
        assert!(status["last_tick"].is_string());
        engine.stop_auto().await;
    }
}
