//! Runtime configuration.
//!
//! Every timeout and cap the backend honors lives here, with defaults that
//! match the documented behavior. Each value can be overridden through a
//! `TERMINUS_*` environment variable; the CLI additionally exposes the most
//! commonly tuned ones as flags.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WORKSPACE_ROOT: &str = "/tmp/terminus_workspace";

/// Fixed prompt shown to every client regardless of the underlying shell.
pub const PROMPT: &str = "terminuside:~# ";

/// Pattern of host prompts rewritten to [`PROMPT`] before output reaches
/// subscribers.
pub const DEFAULT_PROMPT_PATTERN: &str = r"[A-Za-z0-9_-]+@[A-Za-z0-9_-]+:~#\s";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root under which per-session workspaces are materialized.
    pub workspace_root: PathBuf,
    /// Shell program spawned for interactive sessions.
    pub shell_program: String,
    /// Arguments passed to the shell (login shell by default).
    pub shell_args: Vec<String>,
    /// Interpreter used for one-shot code execution.
    pub python_bin: String,

    /// Wall-clock budget for a one-shot execution.
    pub execution_deadline: Duration,
    /// Grace between SIGTERM and SIGKILL for a timed-out execution.
    pub execution_kill_grace: Duration,
    /// Per-stream capture cap; beyond it output is truncated.
    pub execution_output_cap: usize,

    /// Grace between SIGTERM and SIGKILL when a PTY is torn down.
    pub pty_kill_grace: Duration,
    /// How long buffered PTY output may drain after the child exits.
    pub pty_drain_deadline: Duration,

    /// Expected heartbeat interval; silence beyond twice this closes the
    /// connection.
    pub ping_interval: Duration,
    /// Zero-connection sessions older than this are reaped.
    pub idle_session_ttl: Duration,
    /// How often the registry reaper runs.
    pub reaper_interval: Duration,

    /// Bound on the per-connection outbound frame queue.
    pub outbound_queue_frames: usize,
    /// Maximum age of a pending output batch before it is flushed.
    pub output_batch_window: Duration,
    /// Maximum size of an output batch before it is flushed.
    pub output_batch_bytes: usize,

    /// Prompt-normalization pattern applied to shell output.
    pub prompt_pattern: String,
    /// Replacement installed where the pattern matches.
    pub prompt_replacement: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            shell_program: "/bin/bash".to_string(),
            shell_args: vec!["-l".to_string()],
            python_bin: "python3".to_string(),
            execution_deadline: Duration::from_secs(10),
            execution_kill_grace: Duration::from_millis(500),
            execution_output_cap: 1024 * 1024,
            pty_kill_grace: Duration::from_secs(2),
            pty_drain_deadline: Duration::from_secs(3),
            ping_interval: Duration::from_secs(30),
            idle_session_ttl: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            outbound_queue_frames: 1024,
            output_batch_window: Duration::from_millis(16),
            output_batch_bytes: 4 * 1024,
            prompt_pattern: DEFAULT_PROMPT_PATTERN.to_string(),
            prompt_replacement: PROMPT.to_string(),
        }
    }
}

impl Settings {
    /// Defaults overlaid with any `TERMINUS_*` environment overrides.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(root) = env_string("TERMINUS_WORKSPACE_ROOT") {
            settings.workspace_root = PathBuf::from(root);
        }
        if let Some(shell) = env_string("TERMINUS_SHELL") {
            settings.shell_program = shell;
            settings.shell_args.clear();
        }
        if let Some(python) = env_string("TERMINUS_PYTHON_BIN") {
            settings.python_bin = python;
        }
        if let Some(secs) = env_u64("TERMINUS_EXECUTION_DEADLINE_SECS") {
            settings.execution_deadline = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_u64("TERMINUS_EXECUTION_OUTPUT_CAP") {
            settings.execution_output_cap = bytes as usize;
        }
        if let Some(secs) = env_u64("TERMINUS_PING_INTERVAL_SECS") {
            settings.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("TERMINUS_IDLE_SESSION_TTL_SECS") {
            settings.idle_session_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("TERMINUS_REAPER_INTERVAL_SECS") {
            settings.reaper_interval = Duration::from_secs(secs);
        }
        if let Some(pattern) = env_string("TERMINUS_PROMPT_PATTERN") {
            settings.prompt_pattern = pattern;
        }
        if let Some(replacement) = env_string("TERMINUS_PROMPT_REPLACEMENT") {
            settings.prompt_replacement = replacement;
        }
        settings
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let settings = Settings::default();
        assert_eq!(settings.execution_deadline, Duration::from_secs(10));
        assert_eq!(settings.execution_output_cap, 1024 * 1024);
        assert_eq!(settings.ping_interval, Duration::from_secs(30));
        assert_eq!(settings.idle_session_ttl, Duration::from_secs(1800));
        assert_eq!(settings.outbound_queue_frames, 1024);
        assert_eq!(settings.prompt_replacement, PROMPT);
    }
}
