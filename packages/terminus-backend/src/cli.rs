//! Command line interface.
//!
//! With no subcommand the binary serves the backend. The `execute`
//! subcommand is a thin HTTP client for the execute endpoint, handy for
//! smoke-testing a running server.
//!
//! Session CRUD and user management belong to external services; for
//! self-contained runs the `--dev-token` / `--dev-session` flags seed the
//! in-memory reference implementations.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::auth::{AuthService, AuthenticatedUser, Role};
use crate::config::Settings;
use crate::repository::Repository;
use crate::router::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "terminus-backend")]
#[command(about = "Terminal and code-execution backend for the Terminus IDE", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Root directory for per-session workspaces.
    #[arg(long = "workspace-root")]
    workspace_root: Option<PathBuf>,

    /// Allowed CORS origins; repeat for several. No flag disables CORS.
    #[arg(long = "cors-allow-origin")]
    cors_allow_origin: Vec<String>,

    /// Seed an auth token: TOKEN:USER_ID:ROLE (role: user|moderator|admin).
    #[arg(long = "dev-token")]
    dev_token: Vec<String>,

    /// Seed a session: USER_ID:NAME. The assigned id is logged at startup.
    #[arg(long = "dev-session")]
    dev_session: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a snippet through a running server and print the result.
    Execute(ExecuteArgs),
}

#[derive(Args, Debug)]
struct ExecuteArgs {
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    token: String,

    #[arg(long = "session-id")]
    session_id: i64,

    /// Code to run; mutually exclusive with --file.
    #[arg(long, conflicts_with = "file")]
    code: Option<String>,

    /// Read the code from a file.
    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long = "input-data")]
    input_data: Option<String>,

    #[arg(long, default_value = "python")]
    language: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid --dev-token {0}, expected TOKEN:USER_ID:ROLE")]
    InvalidDevToken(String),
    #[error("invalid --dev-session {0}, expected USER_ID:NAME")]
    InvalidDevSession(String),
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("either --code or --file is required")]
    MissingCode,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match &cli.command {
        Some(Command::Execute(args)) => run_execute(args, &cli),
        None => run_server(&cli),
    }
}

fn run_server(cli: &Cli) -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut settings = Settings::from_env();
    if let Some(root) = &cli.workspace_root {
        settings.workspace_root = root.clone();
    }

    let dev_tokens = parse_dev_tokens(&cli.dev_token)?;
    let dev_sessions = parse_dev_sessions(&cli.dev_session)?;
    let cors = build_cors_layer(cli)?;

    let addr = format!("{}:{}", cli.host, cli.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let auth = Arc::new(AuthService::new());
        for (token, user) in dev_tokens {
            auth.register_token(token, user).await;
        }

        let repository = Arc::new(Repository::new());
        for (user_id, name) in dev_sessions {
            let session = repository.create_session(user_id, &name, None).await;
            info!(session_id = session.id, user_id, name = %session.name, "seeded session");
        }

        let state = AppState::new(Arc::new(settings), auth, repository)
            .map_err(|err| CliError::Server(err.to_string()))?;
        state.registry.start_reaper();

        let mut router = build_router(state);
        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "terminus backend listening");
        axum::serve(listener, router)
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_execute(args: &ExecuteArgs, cli: &Cli) -> Result<(), CliError> {
    let code = match (&args.code, &args.file) {
        (Some(code), _) => code.clone(),
        (None, Some(file)) => std::fs::read_to_string(file)?,
        (None, None) => return Err(CliError::MissingCode),
    };

    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", cli.host, cli.port));
    let url = format!(
        "{}/api/terminal/code/execute",
        endpoint.trim_end_matches('/')
    );

    let client = HttpClient::builder().build()?;
    let response = client
        .post(url)
        .bearer_auth(&args.token)
        .json(&json!({
            "code": code,
            "session_id": args.session_id,
            "language": args.language,
            "input_data": args.input_data,
        }))
        .send()?;

    let status = response.status();
    let text = response.text()?;
    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: Value = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    println!("{pretty}");
    std::io::stdout().flush()?;
    Ok(())
}

fn parse_dev_tokens(specs: &[String]) -> Result<Vec<(String, AuthenticatedUser)>, CliError> {
    let mut tokens = Vec::new();
    for spec in specs {
        let mut parts = spec.splitn(3, ':');
        let (token, user_id, role) = match (parts.next(), parts.next(), parts.next()) {
            (Some(token), Some(user_id), Some(role)) => (token, user_id, role),
            _ => return Err(CliError::InvalidDevToken(spec.clone())),
        };
        let user_id: i64 = user_id
            .parse()
            .map_err(|_| CliError::InvalidDevToken(spec.clone()))?;
        let role = match role {
            "user" => Role::User,
            "moderator" => Role::Moderator,
            "admin" => Role::Admin,
            _ => return Err(CliError::InvalidDevToken(spec.clone())),
        };
        tokens.push((
            token.to_string(),
            AuthenticatedUser {
                user_id,
                username: format!("user{user_id}"),
                role,
            },
        ));
    }
    Ok(tokens)
}

fn parse_dev_sessions(specs: &[String]) -> Result<Vec<(i64, String)>, CliError> {
    let mut sessions = Vec::new();
    for spec in specs {
        let (user_id, name) = spec
            .split_once(':')
            .ok_or_else(|| CliError::InvalidDevSession(spec.clone()))?;
        let user_id: i64 = user_id
            .parse()
            .map_err(|_| CliError::InvalidDevSession(spec.clone()))?;
        sessions.push((user_id, name.to_string()));
    }
    Ok(sessions)
}

fn build_cors_layer(cli: &Cli) -> Result<Option<CorsLayer>, CliError> {
    if cli.cors_allow_origin.is_empty() {
        return Ok(None);
    }
    let mut origins: Vec<axum::http::HeaderValue> = Vec::new();
    for origin in &cli.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    Ok(Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        eprintln!("{pretty}");
    } else {
        eprintln!("{text}");
    }
    Ok(())
}
