// Shared test harness: in-memory backend with seeded users and sessions,
// tower `oneshot` helpers for HTTP, and a live listener for WebSocket tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use terminus_backend::auth::{AuthService, AuthenticatedUser, Role};
use terminus_backend::config::Settings;
use terminus_backend::repository::Repository;
use terminus_backend::router::{build_router_with_state, AppState};

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";
pub const ADMIN_TOKEN: &str = "admin-token";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    /// Alice's seeded session.
    pub session_id: i64,
    _workspace_root: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(Settings::default()).await
    }

    pub async fn with_settings(mut settings: Settings) -> Self {
        let workspace_root = tempfile::tempdir().expect("create workspace root");
        settings.workspace_root = workspace_root.path().to_path_buf();

        let auth = Arc::new(AuthService::new());
        auth.register_token(
            ALICE_TOKEN,
            AuthenticatedUser {
                user_id: 1,
                username: "alice".to_string(),
                role: Role::User,
            },
        )
        .await;
        auth.register_token(
            BOB_TOKEN,
            AuthenticatedUser {
                user_id: 2,
                username: "bob".to_string(),
                role: Role::User,
            },
        )
        .await;
        auth.register_token(
            ADMIN_TOKEN,
            AuthenticatedUser {
                user_id: 3,
                username: "root".to_string(),
                role: Role::Admin,
            },
        )
        .await;

        let repository = Arc::new(Repository::new());
        let session = repository.create_session(1, "alice workspace", None).await;

        let state = AppState::new(Arc::new(settings), auth, repository).expect("build state");
        let (app, state) = build_router_with_state(Arc::new(state));
        Self {
            app,
            state,
            session_id: session.id,
            _workspace_root: workspace_root,
        }
    }

    /// Bind a real listener for WebSocket tests.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let app = self.app.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

pub async fn execute_code_request(
    app: &Router,
    token: Option<&str>,
    session_id: i64,
    code: &str,
    input_data: Option<&str>,
) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        "/api/terminal/code/execute",
        token,
        Some(json!({
            "code": code,
            "session_id": session_id,
            "language": "python",
            "input_data": input_data,
        })),
    )
    .await
}

/// Short settings for tests that exercise deadlines.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.execution_deadline = Duration::from_secs(1);
    settings.ping_interval = Duration::from_millis(500);
    settings.pty_kill_grace = Duration::from_millis(500);
    settings
}
