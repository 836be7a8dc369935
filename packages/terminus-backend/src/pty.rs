//! PTY supervision.
//!
//! One interactive shell per live session, attached to a pseudo-terminal.
//! A dedicated reader thread copies bytes from the PTY master into a
//! broadcast channel; subscribers (stream broker connections) receive
//! normalized output by copy. Input is funneled through an unbounded channel
//! drained by a writer thread, so callers never block on the PTY.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use regex_lite::Regex;
use terminus_error::TerminusError;

use crate::config::Settings;
use crate::repository::now_millis;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_SIZE: usize = 8 * 1024;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Spawning,
    Running,
    Draining,
    Closed,
}

/// Rewrites host-specific prompts to the fixed client-facing prompt and
/// strips the bootstrap lines used to install it.
pub struct OutputNormalizer {
    pattern: Regex,
    replacement: String,
    bootstrap_export: String,
}

impl OutputNormalizer {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, TerminusError> {
        let pattern = Regex::new(pattern)
            .map_err(|err| TerminusError::internal(format!("invalid prompt pattern: {err}")))?;
        Ok(Self {
            pattern,
            replacement: replacement.to_string(),
            bootstrap_export: format!("export PS1=\"{replacement}\""),
        })
    }

    /// Lines the supervisor writes into the shell right after spawn.
    pub fn bootstrap_input(&self) -> String {
        format!("{}\nclear\necho ''\n", self.bootstrap_export)
    }

    pub fn normalize(&self, chunk: &str) -> String {
        let replaced = self.pattern.replace_all(chunk, self.replacement.as_str());
        replaced
            .split_inclusive('\n')
            .filter(|line| {
                let trimmed = line.trim();
                trimmed != self.bootstrap_export && trimmed != "clear" && trimmed != "echo ''"
            })
            .collect()
    }
}

/// Spawns PTY-backed shells configured from [`Settings`].
pub struct PtySupervisor {
    settings: Arc<Settings>,
    normalizer: Arc<OutputNormalizer>,
}

impl PtySupervisor {
    pub fn new(settings: Arc<Settings>) -> Result<Self, TerminusError> {
        let normalizer = Arc::new(OutputNormalizer::new(
            &settings.prompt_pattern,
            &settings.prompt_replacement,
        )?);
        Ok(Self {
            settings,
            normalizer,
        })
    }

    /// Allocate a pseudo-terminal and fork the login shell with
    /// `cwd = workspace_path` and the given environment overlay.
    pub fn spawn(
        &self,
        session_id: i64,
        workspace_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Arc<PtySession>, TerminusError> {
        let size = TerminalSize::default();
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TerminusError::pty(format!("openpty failed: {err}")))?;

        let mut cmd = CommandBuilder::new(&self.settings.shell_program);
        for arg in &self.settings.shell_args {
            cmd.arg(arg);
        }
        cmd.cwd(workspace_path);
        cmd.env("TERM", "xterm-256color");
        cmd.env("SHELL", "/bin/bash");
        cmd.env("PS1", &self.settings.prompt_replacement);
        cmd.env("HOME", workspace_path);
        cmd.env("LANG", "C.UTF-8");
        cmd.env("LC_ALL", "C.UTF-8");
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| TerminusError::pty(format!("shell spawn failed: {err}")))?;
        // The slave side must close in this process or the reader never sees
        // EOF when the shell exits.
        drop(pair.slave);

        let mut writer = pair
            .master
            .take_writer()
            .map_err(|err| TerminusError::pty(format!("pty writer unavailable: {err}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| TerminusError::pty(format!("pty reader unavailable: {err}")))?;

        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (state_tx, _) = watch::channel(PtyState::Spawning);

        let session = Arc::new(PtySession {
            session_id,
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(Some(child)),
            input_tx,
            output_tx: output_tx.clone(),
            state: Arc::new(state_tx),
            size: Mutex::new(size),
            created_at: now_millis(),
            last_activity: AtomicI64::new(now_millis()),
            drain_deadline: self.settings.pty_drain_deadline,
        });

        // Writer thread: drains the input channel into the PTY master.
        std::thread::spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Reader thread: PTY master -> normalize -> broadcast.
        let normalizer = self.normalizer.clone();
        let state = session.state.clone();
        let reader_output_tx = output_tx;
        std::thread::spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if *state.borrow() == PtyState::Spawning {
                            let _ = state.send_replace(PtyState::Running);
                        }
                        let text = String::from_utf8_lossy(&buf[..n]);
                        let normalized = normalizer.normalize(&text);
                        if !normalized.is_empty() {
                            // No subscribers means the output is discarded,
                            // which is allowed once nothing is attached.
                            let _ = reader_output_tx.send(normalized);
                        }
                    }
                    Err(err) => {
                        debug!(session_id, %err, "pty read ended");
                        break;
                    }
                }
            }
            let _ = state.send_replace(PtyState::Closed);
        });

        // Exit monitor: reap a shell that exits on its own and start the
        // drain so subscribers observe EOF.
        let monitor = session.clone();
        tokio::spawn(async move {
            loop {
                sleep(EXIT_POLL_INTERVAL).await;
                let mut guard = monitor.child.lock().await;
                match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            info!(
                                session_id = monitor.session_id,
                                code = status.exit_code(),
                                "shell exited"
                            );
                            *guard = None;
                            drop(guard);
                            monitor.begin_drain().await;
                            break;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(session_id = monitor.session_id, %err, "shell wait failed");
                            break;
                        }
                    },
                    None => break,
                }
            }
        });

        // Install the stable prompt before the first client sees output.
        session.write(self.normalizer.bootstrap_input().into_bytes())?;

        info!(session_id, cwd = %workspace_path.display(), "pty session spawned");
        Ok(session)
    }
}

/// A live PTY-backed shell. Exactly one exists per active session; the
/// registry owns the handle and tears it down.
pub struct PtySession {
    pub session_id: i64,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    output_tx: broadcast::Sender<String>,
    state: Arc<watch::Sender<PtyState>>,
    size: Mutex<TerminalSize>,
    pub created_at: i64,
    last_activity: AtomicI64,
    drain_deadline: Duration,
}

impl PtySession {
    /// Enqueue raw bytes for the shell. Never blocks.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), TerminusError> {
        self.touch();
        self.input_tx
            .send(bytes)
            .map_err(|_| TerminusError::pty("shell input channel closed"))
    }

    /// New subscription to normalized shell output. Only output produced
    /// after this call is visible; there is no replay buffer.
    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.output_tx.subscribe()
    }

    /// Next chunk from a subscription, or `None` once `deadline` elapses or
    /// the session has closed. Lagged subscribers skip ahead rather than
    /// erroring.
    pub async fn read(
        rx: &mut broadcast::Receiver<String>,
        deadline: Duration,
    ) -> Option<String> {
        let end = Instant::now() + deadline;
        loop {
            match tokio::time::timeout_at(end, rx.recv()).await {
                Ok(Ok(chunk)) => return Some(chunk),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PtyState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PtyState {
        *self.state.borrow()
    }

    pub async fn size(&self) -> TerminalSize {
        *self.size.lock().await
    }

    pub fn last_activity_millis(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminusError> {
        self.touch();
        let guard = self.master.lock().await;
        let master = guard
            .as_ref()
            .ok_or_else(|| TerminusError::pty("terminal already closed"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| TerminusError::pty(format!("resize failed: {err}")))?;
        *self.size.lock().await = TerminalSize { cols, rows };
        Ok(())
    }

    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL; reap the child, close the
    /// master, and let buffered output drain before the session reports
    /// `Closed`.
    pub async fn kill(&self, grace: Duration) {
        self.begin_drain_state();

        let pid = {
            let guard = self.child.lock().await;
            guard.as_ref().and_then(|child| child.process_id())
        };

        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if !self.reap(grace).await {
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
                if !self.reap(REAP_DEADLINE).await {
                    warn!(session_id = self.session_id, "shell survived SIGKILL");
                }
            }
        } else {
            *self.child.lock().await = None;
        }

        self.begin_drain().await;

        // Give the reader thread until the drain deadline to deliver what is
        // left, then declare the session closed regardless.
        let mut state_rx = self.state.subscribe();
        let drained = tokio::time::timeout(self.drain_deadline, async {
            while *state_rx.borrow() != PtyState::Closed {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(session_id = self.session_id, "drain deadline expired");
        }
        let _ = self.state.send_replace(PtyState::Closed);
        info!(session_id = self.session_id, "pty session closed");
    }

    /// Poll-reap the child for up to `deadline`. Returns true once reaped.
    async fn reap(&self, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut() {
                    Some(child) => {
                        if let Ok(Some(_)) = child.try_wait() {
                            *guard = None;
                            return true;
                        }
                    }
                    None => return true,
                }
            }
            if Instant::now() >= end {
                return false;
            }
            sleep(KILL_POLL_INTERVAL).await;
        }
    }

    fn begin_drain_state(&self) {
        let current = *self.state.borrow();
        if current != PtyState::Closed {
            let _ = self.state.send_replace(PtyState::Draining);
        }
    }

    /// Drop the master so the reader thread observes EOF.
    async fn begin_drain(&self) {
        self.begin_drain_state();
        let _ = self.master.lock().await.take();
    }
}
