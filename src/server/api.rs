use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::campaign::{CampaignRequest, CampaignService, ResponseSubmission, SendOutcome};
use crate::errors::{CampaignError, RunError};
use crate::models::RecipientFilter;
use crate::pipeline::{PipelineRunner, RunQueryService, RunRequest};

pub struct AppState {
    pub runner: Arc<PipelineRunner>,
    pub runs: RunQueryService,
    pub campaigns: CampaignService,
}

pub type SharedState = Arc<AppState>;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    pub since_seq: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub response: String,
}

/// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer when the server was started with connect info.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            forwarded
                .to_str()
                .ok()
                .and_then(|s| s.split(',').next())
                .and_then(|s| s.trim().parse::<IpAddr>().ok())
        } else if let Some(real_ip) = parts.headers.get("x-real-ip") {
            real_ip.to_str().ok().and_then(|s| s.trim().parse::<IpAddr>().ok())
        } else {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        };
        Ok(ClientIp(ip))
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Unprocessable(String),
    Busy(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Busy(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Validation(msg) => ApiError::Unprocessable(msg),
            RunError::Busy => ApiError::Busy(err.to_string()),
            RunError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => {
                error!("Pipeline request failed: {:#}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        match err {
            CampaignError::Validation(msg) => ApiError::Unprocessable(msg),
            CampaignError::NoRecipients => ApiError::Unprocessable(err.to_string()),
            CampaignError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            other => {
                error!("Campaign request failed: {:#}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/pipeline/run", post(trigger_run))
        .route("/api/pipeline/status", get(pipeline_status))
        .route("/api/pipeline/runs", get(list_runs))
        .route("/api/pipeline/runs/{id}", get(get_run))
        .route("/api/pipeline/runs/{id}/logs", get(get_run_logs))
        .route("/api/email-campaigns", get(list_campaigns))
        .route("/api/email-campaigns/preview", post(preview_campaign))
        .route("/api/email-campaigns/send", post(send_campaign))
        .route("/api/email-campaigns/{id}", get(get_campaign))
        .route("/api/email-campaigns/{id}/cancel", post(cancel_campaign))
        .route("/api/response", post(record_response))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Runs synchronously from the caller's point of view. The run itself is
/// spawned so a dropped connection cannot abandon it half-way.
async fn trigger_run(
    State(state): State<SharedState>,
    Json(request): Json<RunRequest>,
) -> Response {
    let runner = state.runner.clone();
    let joined = tokio::spawn(async move { runner.run(&request).await }).await;
    match joined {
        Ok(Ok(report)) => {
            let status = if report.ok {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(report)).into_response()
        }
        Ok(Err(e)) => {
            let status = match &e {
                RunError::Busy => StatusCode::TOO_MANY_REQUESTS,
                RunError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => {
                    error!("Pipeline run could not start: {:#}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(json!({"ok": false, "output": [e.to_string()]}))).into_response()
        }
        Err(e) => {
            error!("Pipeline run task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "output": ["Pipeline run task failed"]})),
            )
                .into_response()
        }
    }
}

async fn pipeline_status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.status().await?))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.list_runs(params.limit).await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.get_run(id).await?))
}

async fn get_run_logs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(params): Query<LogParams>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.runs.logs(id, params.since_seq, params.limit).await?,
    ))
}

async fn list_campaigns(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.campaigns.list(params.limit).await?))
}

async fn preview_campaign(
    State(state): State<SharedState>,
    Json(filter): Json<RecipientFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.campaigns.preview(filter).await?))
}

async fn send_campaign(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    Json(request): Json<CampaignRequest>,
) -> Result<Response, ApiError> {
    let requested_by = ip.map(|ip| ip.to_string());
    match state.campaigns.send(request, requested_by).await {
        Ok(SendOutcome::DryRun(preview)) => Ok(Json(preview).into_response()),
        Ok(SendOutcome::Queued { campaign_id, count }) => Ok((
            StatusCode::CREATED,
            Json(json!({
                "message": "Campaign queued",
                "campaign_id": campaign_id,
                "count": count,
            })),
        )
            .into_response()),
        Err(CampaignError::NoRecipients) => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"message": "No recipients matched filters", "count": 0})),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn get_campaign(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.campaigns.detail(id).await?))
}

async fn cancel_campaign(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state.campaigns.cancel(id).await?;
    Ok(Json(json!({
        "message": "Campaign cancelled",
        "campaign": campaign,
    })))
}

async fn record_response(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Json(body): Json<ResponseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = ResponseSubmission::parse(&body.token, &body.email, &body.response)?;
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.chars().take(255).collect::<String>());
    let email = submission.email.clone();
    let response = submission.response;
    state
        .campaigns
        .record_response(submission, ip.map(|ip| ip.to_string()), user_agent)
        .await?;
    Ok(Json(json!({
        "message": "Response recorded",
        "email": email,
        "response": response,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::dispatcher::tests::RecordingMailer;
    use crate::campaign::{CampaignDispatcher, CampaignQueue, RetryPolicy};
    use crate::config::{CampaignSection, PipelineSection};
    use crate::db::{Db, DbHandle, NewPlace};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        dir: TempDir,
        db: DbHandle,
        router: Router,
    }

    fn test_app(script: &str) -> TestApp {
        let dir = TempDir::new().unwrap();
        let pipeline = PipelineSection {
            project_root: dir.path().to_path_buf(),
            state_dir: dir.path().join("state"),
            command: vec!["sh".into(), "-c".into(), script.into()],
            timeout_secs: 10,
            ..Default::default()
        };
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let campaign_config = CampaignSection::default();
        let dispatcher = CampaignDispatcher::new(
            db.clone(),
            Arc::new(RecordingMailer::default()),
            "http://localhost:8000".into(),
            &campaign_config,
        );
        let queue = CampaignQueue::new(
            dispatcher,
            db.clone(),
            RetryPolicy::from_config(&campaign_config),
        );
        let state = Arc::new(AppState {
            runner: Arc::new(PipelineRunner::new(
                db.clone(),
                pipeline.clone(),
                "http://127.0.0.1:8010".into(),
            )),
            runs: RunQueryService::new(db.clone(), &pipeline),
            campaigns: CampaignService::new(db.clone(), queue, 100),
        });
        TestApp {
            dir,
            db,
            router: api_router().with_state(state),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app("true");
        let resp = app.router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_when_idle() {
        let app = test_app("true");
        let (status, body) = send(&app.router, get("/api/pipeline/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "IDLE");
        assert_eq!(body["running"], false);
        assert!(body["run_id"].is_null());
    }

    #[tokio::test]
    async fn test_run_then_query() {
        let app = test_app("echo first; echo second");
        let (status, report) = send(
            &app.router,
            post_json("/api/pipeline/run", json!({"query": "coffee shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["ok"], true);
        let run_id = report["run_id"].as_i64().unwrap();

        let (_, status_view) = send(&app.router, get("/api/pipeline/status")).await;
        assert_eq!(status_view["status"], "SUCCESS");
        assert_eq!(status_view["running"], false);
        assert_eq!(status_view["run_id"], run_id);

        let (_, listing) = send(&app.router, get("/api/pipeline/runs?limit=5")).await;
        assert_eq!(listing["total"], 1);
        assert_eq!(listing["runs"][0]["running"], false);

        let (status, run) = send(&app.router, get(&format!("/api/pipeline/runs/{}", run_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["query"], "coffee shop");

        let (_, logs) = send(
            &app.router,
            get(&format!("/api/pipeline/runs/{}/logs?since_seq=1", run_id)),
        )
        .await;
        assert_eq!(logs["count"], 1);
        assert_eq!(logs["logs"][0]["line"], "second");
        assert_eq!(logs["last_seq"], 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_500() {
        let app = test_app("echo broken; exit 3");
        let (status, report) = send(
            &app.router,
            post_json("/api/pipeline/run", json!({"query": "coffee shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(report["ok"], false);
        assert!(report["run_id"].is_i64());
    }

    #[tokio::test]
    async fn test_invalid_run_request() {
        let app = test_app("true");
        let (status, body) = send(
            &app.router,
            post_json("/api/pipeline/run", json!({"query": "ab"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_busy_run_is_429() {
        let app = test_app("true");
        let lock_path = PipelineSection {
            project_root: app.dir.path().to_path_buf(),
            state_dir: app.dir.path().join("state"),
            ..Default::default()
        }
        .lock_path();
        let _held = crate::pipeline::lock::RunLock::new(lock_path)
            .try_acquire()
            .unwrap();

        let (status, body) = send(
            &app.router,
            post_json("/api/pipeline/run", json!({"query": "coffee shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["ok"], false);
        assert!(body["output"][0].as_str().unwrap().contains("already running"));

        let (_, status_view) = send(&app.router, get("/api/pipeline/status")).await;
        assert_eq!(status_view["running"], true);
    }

    #[tokio::test]
    async fn test_missing_run_is_404() {
        let app = test_app("true");
        let (status, body) = send(&app.router, get("/api/pipeline/runs/99")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("99"));
        let (status, _) = send(&app.router, get("/api/pipeline/runs/99/logs")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_campaign_flow() {
        let app = test_app("true");
        app.db
            .call(|db| {
                db.insert_place(&NewPlace {
                    place_id: "p1".into(),
                    name: "Cafe".into(),
                    status: "NEW".into(),
                    ..Default::default()
                })?;
                db.insert_email("p1", "owner@example.com", "website")?;
                Ok(())
            })
            .await
            .unwrap();

        let (status, preview) = send(
            &app.router,
            post_json("/api/email-campaigns/preview", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["count"], 1);
        assert!(preview.get("dry_run").is_none());

        let (status, dry) = send(
            &app.router,
            post_json(
                "/api/email-campaigns/send",
                json!({"subject": "Hi", "body_text": "Hello there", "dry_run": true}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dry["dry_run"], true);

        let (status, queued) = send(
            &app.router,
            Request::builder()
                .method("POST")
                .uri("/api/email-campaigns/send")
                .header("content-type", "application/json")
                .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
                .body(Body::from(
                    json!({"subject": "Hi", "body_text": "Hello {{checkin_link}}"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(queued["message"], "Campaign queued");
        assert_eq!(queued["count"], 1);
        let id = queued["campaign_id"].as_i64().unwrap();

        let (status, detail) =
            send(&app.router, get(&format!("/api/email-campaigns/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["campaign"]["requested_by"], "203.0.113.7");
        assert!(detail["response_summary"]["PENDING"].is_u64());

        let (_, listing) = send(&app.router, get("/api/email-campaigns")).await;
        assert_eq!(listing["total"], 1);
    }

    #[tokio::test]
    async fn test_send_without_recipients_is_422() {
        let app = test_app("true");
        let (status, body) = send(
            &app.router,
            post_json(
                "/api/email-campaigns/send",
                json!({"subject": "Hi", "body_text": "Hello there"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["message"], "No recipients matched filters");
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_cancel_missing_campaign_is_404() {
        let app = test_app("true");
        let (status, _) = send(
            &app.router,
            post_json("/api/email-campaigns/7/cancel", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_record_response() {
        let app = test_app("true");
        let (status, body) = send(
            &app.router,
            Request::builder()
                .method("POST")
                .uri("/api/response")
                .header("content-type", "application/json")
                .header("x-real-ip", "198.51.100.4")
                .body(Body::from(
                    json!({"token": "abc", "email": "a@example.com", "response": "unsubscribe"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "unsubscribe");
        assert_eq!(body["email"], "a@example.com");

        let unsubscribed = app.db.call(|db| db.unsubscribed_emails()).await.unwrap();
        assert_eq!(unsubscribed, vec!["a@example.com"]);

        let (status, _) = send(
            &app.router,
            post_json(
                "/api/response",
                json!({"token": "abc", "email": "a@example.com", "response": "maybe"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
