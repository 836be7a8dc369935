//! One-shot code execution.
//!
//! Snippets run to completion in a fresh interpreter with the session
//! workspace as working directory, so relative reads see the session's
//! files. Nothing is shared with the interactive shell: variables defined in
//! an editor run do not leak into the terminal. The PTY injection variant
//! types the snippet into the live shell instead and returns immediately.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;

use terminus_error::TerminusError;

use crate::config::Settings;
use crate::pty::PtySession;

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

const TRUNCATION_SENTINEL: &str = "\n…[truncated]\n";

#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub language: String,
    pub code: String,
    pub stdin: Option<String>,
    pub cwd: PathBuf,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn status_label(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.exit_status == 0 {
            "ok"
        } else {
            "error"
        }
    }
}

pub struct ExecutionEngine {
    settings: Arc<Settings>,
}

impl ExecutionEngine {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Run a snippet to completion and return its bounded result.
    pub async fn execute(&self, job: ExecutionJob) -> Result<ExecutionResult, TerminusError> {
        if !job.language.eq_ignore_ascii_case("python") {
            return Err(TerminusError::Execution {
                message: format!("Unsupported language: {}", job.language),
            });
        }

        tokio::fs::create_dir_all(&job.cwd)
            .await
            .map_err(|err| TerminusError::Execution {
                message: format!("working directory unavailable: {err}"),
            })?;

        // The snippet lands in a hidden script inside the workspace so the
        // program can open its session files by relative path.
        let script = job.cwd.join(format!(
            ".terminus_run_{}_{}.py",
            std::process::id(),
            SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&script, &job.code)
            .await
            .map_err(|err| TerminusError::Execution {
                message: format!("failed to stage code: {err}"),
            })?;

        let result = self.run_script(&script, &job).await;
        let _ = tokio::fs::remove_file(&script).await;
        result
    }

    /// Inject the snippet into the session's live shell. Results arrive as
    /// normal terminal output; the return only acknowledges submission.
    pub fn execute_in_pty(&self, pty: &PtySession, code: &str) -> Result<(), TerminusError> {
        let mut line = code.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        pty.write(line.into_bytes())
    }

    async fn run_script(
        &self,
        script: &Path,
        job: &ExecutionJob,
    ) -> Result<ExecutionResult, TerminusError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.settings.python_bin);
        cmd.arg(script)
            .current_dir(&job.cwd)
            .stdin(if job.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| TerminusError::Execution {
            message: format!("failed to start {}: {err}", self.settings.python_bin),
        })?;

        if let Some(input) = job.stdin.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(input.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout = child.stdout.take().ok_or_else(|| TerminusError::Execution {
            message: "child stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| TerminusError::Execution {
            message: "child stderr unavailable".to_string(),
        })?;

        // Readers must run while we wait, otherwise a chatty program fills
        // the pipe and never exits.
        let cap = self.settings.execution_output_cap;
        let stdout_task = tokio::spawn(read_capped(stdout, cap));
        let stderr_task = tokio::spawn(read_capped(stderr, cap));

        let mut timed_out = false;
        let status = match timeout(job.deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(TerminusError::Execution {
                    message: format!("wait failed: {err}"),
                })
            }
            Err(_) => {
                timed_out = true;
                debug!(deadline_ms = job.deadline.as_millis() as u64, "execution deadline hit");
                self.terminate(&mut child).await
            }
        };

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        Ok(ExecutionResult {
            stdout: stdout_text,
            stderr: stderr_text,
            exit_status: exit_code(&status),
            timed_out,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// SIGTERM, short grace, then SIGKILL.
    async fn terminate(&self, child: &mut Child) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;

        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match timeout(self.settings.execution_kill_grace, child.wait()).await {
            Ok(Ok(status)) => status,
            _ => {
                let _ = child.kill().await;
                child
                    .wait()
                    .await
                    .unwrap_or_else(|_| std::process::ExitStatus::from_raw(libc::SIGKILL))
            }
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Read a stream to EOF, keeping at most `cap` bytes and appending the
/// truncation sentinel when output was dropped. Keeps draining past the cap
/// so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let take = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_SENTINEL);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(settings: Settings) -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(settings))
    }

    fn job(code: &str, cwd: &Path) -> ExecutionJob {
        ExecutionJob {
            language: "python".to_string(),
            code: code.to_string(),
            stdin: None,
            cwd: cwd.to_path_buf(),
            deadline: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn hello_world() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        let result = engine.execute(job("print(1+2)", dir.path())).await.unwrap();
        assert_eq!(result.stdout, "3\n");
        assert_eq!(result.exit_status, 0);
        assert!(!result.timed_out);
        assert_eq!(result.status_label(), "ok");
    }

    #[tokio::test]
    async fn stdin_is_fed_to_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        let mut j = job("print('hi', input())", dir.path());
        j.stdin = Some("Alice\n".to_string());
        let result = engine.execute(j).await.unwrap();
        assert_eq!(result.stdout, "hi Alice\n");
        assert_eq!(result.exit_status, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        let result = engine
            .execute(job("import sys; sys.exit(3)", dir.path()))
            .await
            .unwrap();
        assert_eq!(result.exit_status, 3);
        assert_eq!(result.status_label(), "error");
    }

    #[tokio::test]
    async fn deadline_terminates_sleepers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        let mut j = job("import time; time.sleep(30)", dir.path());
        j.deadline = Duration::from_secs(1);
        let start = Instant::now();
        let result = engine.execute(j).await.unwrap();
        assert!(result.timed_out);
        assert_ne!(result.exit_status, 0);
        assert_eq!(result.status_label(), "timeout");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(result.duration_ms >= 1000);
        assert!(result.duration_ms <= 2000);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.execution_output_cap = 1024;
        let engine = engine_with(settings);
        let result = engine
            .execute(job("print('x' * 100000)", dir.path()))
            .await
            .unwrap();
        assert!(result.stdout.ends_with(TRUNCATION_SENTINEL));
        assert!(result.stdout.len() <= 1024 + TRUNCATION_SENTINEL.len());
        assert_eq!(result.exit_status, 0);
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        let mut j = job("console.log(1)", dir.path());
        j.language = "javascript".to_string();
        let err = engine.execute(j).await.unwrap_err();
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn stderr_is_captured_separately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        let result = engine
            .execute(job("import sys; print('out'); print('err', file=sys.stderr)", dir.path()))
            .await
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pty_injection_types_into_the_shell() {
        use crate::pty::PtySupervisor;

        let settings = Arc::new(Settings::default());
        let supervisor = PtySupervisor::new(settings.clone()).unwrap();
        let engine = ExecutionEngine::new(settings);
        let dir = tempfile::tempdir().unwrap();

        let session = supervisor
            .spawn(9, dir.path(), &std::collections::HashMap::new())
            .expect("spawn shell");
        let mut output = session.subscribe_output();

        engine
            .execute_in_pty(&session, "echo injected_marker")
            .unwrap();

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline && !seen.contains("injected_marker") {
            match tokio::time::timeout(Duration::from_millis(500), output.recv()).await {
                Ok(Ok(chunk)) => seen.push_str(&chunk),
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        assert!(seen.contains("injected_marker"), "output: {seen:?}");
        session.kill(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn scripts_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(Settings::default());
        engine.execute(job("pass", dir.path())).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .collect();
        assert!(leftovers.is_empty(), "temp script should be unlinked");
    }
}
