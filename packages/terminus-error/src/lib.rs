//! Error taxonomy shared between the terminal backend's components and its
//! HTTP/WebSocket surfaces.
//!
//! Every fallible operation in the backend surfaces a [`TerminusError`].
//! HTTP handlers convert it into an RFC-7807 style [`ProblemDetails`] body;
//! the stream broker maps fatal variants onto WebSocket close codes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Normal-closure WebSocket code.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Error)]
pub enum TerminusError {
    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: i64 },

    #[error("invalid workspace path {path}: {message}")]
    PathError { path: String, message: String },

    #[error("workspace error: {message}")]
    Workspace { message: String },

    #[error("pty error: {message}")]
    Pty { message: String },

    #[error("execution failed: {message}")]
    Execution { message: String },

    #[error("execution exceeded deadline of {deadline_ms} ms")]
    ExecutionTimeout { deadline_ms: u64 },

    #[error("client cannot keep up with output")]
    Backpressure,

    #[error("heartbeat lost")]
    IdleTimeout,

    #[error("malformed frame: {message}")]
    BadFrame { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TerminusError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn workspace(message: impl Into<String>) -> Self {
        Self::Workspace {
            message: message.into(),
        }
    }

    pub fn pty(message: impl Into<String>) -> Self {
        Self::Pty {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code carried in `error` frames and problem
    /// bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthFailed { .. } => "AUTH_FAILED",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::PathError { .. } => "PATH_ERROR",
            Self::Workspace { .. } => "WORKSPACE_ERROR",
            Self::Pty { .. } => "PTY_ERROR",
            Self::Execution { .. } => "EXECUTION_ERROR",
            Self::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            Self::Backpressure => "BACKPRESSURE",
            Self::IdleTimeout => "IDLE_TIMEOUT",
            Self::BadFrame { .. } => "BAD_FRAME",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthFailed { .. } => 401,
            Self::SessionNotFound { .. } => 404,
            Self::PathError { .. } | Self::BadFrame { .. } => 400,
            Self::ExecutionTimeout { .. } => 408,
            Self::Backpressure => 429,
            Self::IdleTimeout => 408,
            Self::Workspace { .. }
            | Self::Pty { .. }
            | Self::Execution { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// WebSocket close code for errors that terminate the connection.
    /// Non-fatal variants fall through to `4009` so an unexpected close is
    /// always distinguishable from a clean one.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AuthFailed { .. } => 4001,
            Self::SessionNotFound { .. } => 4002,
            Self::Backpressure => 4003,
            Self::IdleTimeout => 4004,
            _ => 4009,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        ProblemDetails {
            r#type: format!("https://terminus.dev/errors/{}", self.code()),
            title: self.code().to_string(),
            status: self.http_status(),
            detail: Some(self.to_string()),
        }
    }
}

/// RFC-7807 problem body returned by every failing HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
