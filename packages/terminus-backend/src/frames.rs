//! Typed frames for the terminal stream.
//!
//! One JSON object per message, discriminated by `type`. Unknown fields are
//! ignored; unknown `type` values are rejected so a client hears about its
//! mistake instead of being silently dropped.

use serde::{Deserialize, Serialize};

use terminus_error::TerminusError;

use crate::execution::ExecutionResult;

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ShellInput {
        data: String,
    },
    ShellResize {
        cols: u16,
        rows: u16,
    },
    ExecuteCode {
        code: String,
        #[serde(default)]
        input_data: Option<String>,
        #[serde(default)]
        language: Option<String>,
    },
    InputData {
        content: String,
    },
    FileChange,
    Ping {
        timestamp: i64,
    },
}

impl ClientFrame {
    /// Parse a text frame, mapping any failure to `BAD_FRAME`.
    pub fn parse(text: &str) -> Result<Self, TerminusError> {
        serde_json::from_str(text).map_err(|err| TerminusError::BadFrame {
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ShellOutput {
        data: String,
    },
    ShellConnected,
    ShellError {
        error: String,
    },
    CodeExecutionResult {
        status: String,
        output: String,
        error: String,
        exit_status: i32,
        duration_ms: u64,
        timed_out: bool,
    },
    FileChange {
        file_path: String,
        kind: FileChangeKind,
    },
    FileSyncComplete {
        message: String,
    },
    InputDataReceived,
    Pong {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn from_execution(result: &ExecutionResult) -> Self {
        Self::CodeExecutionResult {
            status: result.status_label().to_string(),
            output: result.stdout.clone(),
            error: result.stderr.clone(),
            exit_status: result.exit_status,
            duration_ms: result.duration_ms,
            timed_out: result.timed_out,
        }
    }

    /// Execution failures are reported in-band, never as a transport error.
    pub fn from_execution_error(err: &TerminusError) -> Self {
        Self::CodeExecutionResult {
            status: "error".to_string(),
            output: String::new(),
            error: err.to_string(),
            exit_status: 1,
            duration_ms: 0,
            timed_out: false,
        }
    }

    pub fn error(err: &TerminusError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"INTERNAL_ERROR","message":"serialization failed"}"#
                .to_string()
        })
    }
}
