//! HTTP/WebSocket surface.
//!
//! Routes:
//! - `GET  /api/health`: liveness, exempt from auth.
//! - `GET  /api/terminal/ws/:session_id?token=...`: the terminal stream.
//! - `POST /api/terminal/code/execute`: one-shot execution for the editor's
//!   Run button, bearer-authenticated.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use terminus_error::{ProblemDetails, TerminusError};

use crate::auth::{extract_bearer, AuthService};
use crate::broker::SessionBroker;
use crate::config::Settings;
use crate::execution::{ExecutionEngine, ExecutionJob};
use crate::registry::SessionRegistry;
use crate::repository::Repository;
use crate::workspace::WorkspaceManager;

pub struct AppState {
    pub settings: Arc<Settings>,
    pub auth: Arc<AuthService>,
    pub repository: Arc<Repository>,
    pub workspaces: Arc<WorkspaceManager>,
    pub registry: Arc<SessionRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub broker: Arc<SessionBroker>,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        auth: Arc<AuthService>,
        repository: Arc<Repository>,
    ) -> Result<Self, TerminusError> {
        let workspaces = Arc::new(WorkspaceManager::new(
            settings.workspace_root.clone(),
            repository.clone(),
        ));
        let registry = SessionRegistry::new(settings.clone(), repository.clone(), workspaces.clone())?;
        let engine = Arc::new(ExecutionEngine::new(settings.clone()));
        let broker = Arc::new(SessionBroker::new(
            settings.clone(),
            auth.clone(),
            repository.clone(),
            registry.clone(),
            workspaces.clone(),
            engine.clone(),
        ));
        Ok(Self {
            settings,
            auth,
            repository,
            workspaces,
            registry,
            engine,
            broker,
        })
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, execute_code),
    components(schemas(
        ExecuteCodeRequest,
        ExecuteCodeResponse,
        HealthResponse,
        ProblemDetails
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "terminal", description = "Terminal and code execution")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Terminus(#[from] TerminusError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Terminus(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/terminal/ws/:session_id", get(terminal_ws_handler))
        .route("/api/terminal/code/execute", post(execute_code))
        .with_state(shared.clone());

    let http_logging = match std::env::var("TERMINUS_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        router = router.layer(TraceLayer::new_for_http());
    }

    (router, shared)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "meta"
)]
/// Health
///
/// Liveness probe; requires no authentication.
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade for the interactive terminal. Authentication happens
/// after the upgrade so failures surface as an `error` frame plus a close
/// code the browser can read.
async fn terminal_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<i64>,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let broker = state.broker.clone();
    ws.on_upgrade(move |socket| broker.handle_connection(socket, session_id, query.token))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ExecuteCodeRequest {
    pub code: String,
    pub session_id: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub input_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ExecuteCodeResponse {
    pub output: String,
    pub error: String,
    pub exit_status: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

#[utoipa::path(
    post,
    path = "/api/terminal/code/execute",
    request_body = ExecuteCodeRequest,
    responses(
        (status = 200, description = "Execution result", body = ExecuteCodeResponse),
        (status = 401, description = "Authentication failed", body = ProblemDetails),
        (status = 404, description = "Session not found", body = ProblemDetails)
    ),
    tag = "terminal"
)]
/// Execute Code
///
/// Runs a snippet to completion inside the session workspace and returns the
/// captured result. Shares nothing with the interactive shell.
async fn execute_code(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ExecuteCodeRequest>,
) -> Result<Json<ExecuteCodeResponse>, ApiError> {
    let token =
        extract_bearer(&headers).ok_or_else(|| TerminusError::auth("missing bearer token"))?;
    let session = state
        .repository
        .get_session(request.session_id)
        .await
        .ok_or(TerminusError::SessionNotFound {
            session_id: request.session_id,
        })?;
    state.auth.authorize_session(&token, &session).await?;

    // The workspace must exist even if no shell has attached yet.
    let cwd = state.workspaces.materialize(request.session_id).await?;

    let job = ExecutionJob {
        language: request.language.unwrap_or_else(|| "python".to_string()),
        code: request.code,
        stdin: request.input_data,
        cwd,
        deadline: state.settings.execution_deadline,
    };
    // Execution failures are reported in the body, never as a transport
    // error, mirroring the result frames on the stream path.
    let response = match state.engine.execute(job).await {
        Ok(result) => ExecuteCodeResponse {
            output: result.stdout,
            error: result.stderr,
            exit_status: result.exit_status,
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
        },
        Err(err) => ExecuteCodeResponse {
            output: String::new(),
            error: err.to_string(),
            exit_status: 1,
            duration_ms: 0,
            timed_out: false,
        },
    };
    state.repository.touch_session(request.session_id).await;

    Ok(Json(response))
}
