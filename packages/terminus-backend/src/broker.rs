//! Session stream broker.
//!
//! Terminates one WebSocket connection: authenticates it, binds it to the
//! session's PTY through the registry, and multiplexes typed frames in both
//! directions. Each connection runs a small task group:
//!
//! - a sender task that owns the socket's write half and drains a bounded
//!   outbound queue,
//! - an output pump that batches PTY output into `shell_output` frames,
//! - a subscriber relay for session-wide broadcasts (file changes),
//! - the receive loop itself, which dispatches client frames and tracks the
//!   heartbeat.
//!
//! Long-running handlers (`execute_code`, `file_change`) are spawned as
//! independent tasks so a slow execution never delays a `ping`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use terminus_error::{TerminusError, CLOSE_NORMAL};

use crate::auth::AuthService;
use crate::config::Settings;
use crate::execution::{ExecutionEngine, ExecutionJob};
use crate::frames::{ClientFrame, FileChangeKind, ServerFrame};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::repository::Repository;
use crate::workspace::WorkspaceManager;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const DETACH_FLUSH: Duration = Duration::from_millis(200);
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(10);
const BACKPRESSURE_LIMIT: Duration = Duration::from_secs(1);

enum Outbound {
    Frame(ServerFrame),
    Close(u16, String),
}

pub struct SessionBroker {
    settings: Arc<Settings>,
    auth: Arc<AuthService>,
    repository: Arc<Repository>,
    registry: Arc<SessionRegistry>,
    workspaces: Arc<WorkspaceManager>,
    engine: Arc<ExecutionEngine>,
}

impl SessionBroker {
    pub fn new(
        settings: Arc<Settings>,
        auth: Arc<AuthService>,
        repository: Arc<Repository>,
        registry: Arc<SessionRegistry>,
        workspaces: Arc<WorkspaceManager>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            settings,
            auth,
            repository,
            registry,
            workspaces,
            engine,
        }
    }

    /// Drive one upgraded WebSocket to completion.
    pub async fn handle_connection(
        self: Arc<Self>,
        socket: WebSocket,
        session_id: i64,
        token: Option<String>,
    ) {
        let (ws_sender, mut ws_receiver) = socket.split();

        let (out_tx, out_rx) = mpsc::channel::<Outbound>(self.settings.outbound_queue_frames);
        let sender_task = tokio::spawn(run_sender(ws_sender, out_rx));

        // AUTH: token from the query string, session ownership from the
        // repository.
        let user = match self.authenticate(session_id, token).await {
            Ok(user) => user,
            Err(err) => {
                warn!(session_id, code = err.code(), "connection rejected");
                let _ = out_tx.send(Outbound::Frame(ServerFrame::error(&err))).await;
                let _ = out_tx
                    .send(Outbound::Close(err.close_code(), err.code().to_string()))
                    .await;
                let _ = timeout(DETACH_FLUSH, sender_task).await;
                return;
            }
        };

        // ATTACH: create-or-join the PTY session and materialize the
        // workspace.
        let handle = match self.registry.acquire(session_id, &user).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(session_id, code = err.code(), "attach failed");
                let _ = out_tx.send(Outbound::Frame(ServerFrame::error(&err))).await;
                let _ = out_tx
                    .send(Outbound::Close(err.close_code(), err.code().to_string()))
                    .await;
                let _ = timeout(DETACH_FLUSH, sender_task).await;
                return;
            }
        };
        info!(session_id, user_id = user.user_id, "terminal attached");

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<TerminusError>();

        // Subscribe before announcing the shell so no output is lost between
        // the two.
        let output_rx = handle.pty.subscribe_output();
        let _ = out_tx
            .send(Outbound::Frame(ServerFrame::ShellConnected))
            .await;

        let pump_task = tokio::spawn(run_output_pump(
            output_rx,
            out_tx.clone(),
            fatal_tx.clone(),
            self.settings.output_batch_window,
            self.settings.output_batch_bytes,
        ));
        let relay_task = tokio::spawn(run_broadcast_relay(
            handle.subscribe_frames(),
            out_tx.clone(),
        ));

        // RUN: the multiplex loop.
        let mut exec_tasks: JoinSet<()> = JoinSet::new();
        let mut pending_stdin: Option<String> = None;
        let mut ping_deadline: Option<Instant> = None;

        let close_reason: Option<TerminusError> = loop {
            // Reap finished handler tasks so the set stays small.
            while exec_tasks.try_join_next().is_some() {}

            let armed_deadline = ping_deadline;
            let heartbeat = async move {
                match armed_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = heartbeat => {
                    break Some(TerminusError::IdleTimeout);
                }
                fatal = fatal_rx.recv() => {
                    match fatal {
                        Some(err) => break Some(err),
                        None => continue,
                    }
                }
                incoming = ws_receiver.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            debug!(session_id, %err, "websocket receive error");
                            break None;
                        }
                        None => break None,
                    };
                    match message {
                        Message::Text(text) => {
                            match ClientFrame::parse(&text) {
                                Ok(frame) => {
                                    if let Err(err) = self
                                        .dispatch(
                                            frame,
                                            &handle,
                                            &out_tx,
                                            &mut exec_tasks,
                                            &mut pending_stdin,
                                            &mut ping_deadline,
                                        )
                                        .await
                                    {
                                        break Some(err);
                                    }
                                }
                                Err(err) => {
                                    if send_frame(&out_tx, ServerFrame::error(&err)).await.is_err() {
                                        break Some(TerminusError::Backpressure);
                                    }
                                }
                            }
                        }
                        // Binary data is raw terminal input.
                        Message::Binary(data) => {
                            if let Err(err) = handle.pty.write(data) {
                                let frame = ServerFrame::ShellError {
                                    error: err.to_string(),
                                };
                                let _ = send_frame(&out_tx, frame).await;
                            }
                        }
                        Message::Close(_) => break None,
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
            }
        };

        // DETACH: cancel in-flight work, flush briefly, release the session.
        exec_tasks.abort_all();
        match &close_reason {
            Some(err) => {
                let _ = timeout(
                    SEND_TIMEOUT,
                    out_tx.send(Outbound::Frame(ServerFrame::error(err))),
                )
                .await;
                let _ = timeout(
                    SEND_TIMEOUT,
                    out_tx.send(Outbound::Close(err.close_code(), err.code().to_string())),
                )
                .await;
            }
            None => {
                let _ = timeout(
                    SEND_TIMEOUT,
                    out_tx.send(Outbound::Close(CLOSE_NORMAL, "bye".to_string())),
                )
                .await;
            }
        }
        drop(out_tx);
        let _ = timeout(DETACH_FLUSH, sender_task).await;
        pump_task.abort();
        relay_task.abort();
        self.registry.release(session_id).await;
        info!(
            session_id,
            user_id = user.user_id,
            code = close_reason.as_ref().map(|err| err.code()).unwrap_or("NORMAL"),
            "terminal detached"
        );
    }

    async fn authenticate(
        &self,
        session_id: i64,
        token: Option<String>,
    ) -> Result<crate::auth::AuthenticatedUser, TerminusError> {
        let token = token.ok_or_else(|| TerminusError::auth("missing token"))?;
        let session = self
            .repository
            .get_session(session_id)
            .await
            .ok_or(TerminusError::SessionNotFound { session_id })?;
        self.auth.authorize_session(&token, &session).await
    }

    async fn dispatch(
        &self,
        frame: ClientFrame,
        handle: &Arc<SessionHandle>,
        out_tx: &mpsc::Sender<Outbound>,
        exec_tasks: &mut JoinSet<()>,
        pending_stdin: &mut Option<String>,
        ping_deadline: &mut Option<Instant>,
    ) -> Result<(), TerminusError> {
        handle.touch();
        match frame {
            ClientFrame::ShellInput { data } => {
                if let Err(err) = handle.pty.write(data.into_bytes()) {
                    let frame = ServerFrame::ShellError {
                        error: err.to_string(),
                    };
                    send_frame(out_tx, frame).await?;
                }
            }
            ClientFrame::ShellResize { cols, rows } => {
                if let Err(err) = handle.pty.resize(cols, rows).await {
                    let frame = ServerFrame::ShellError {
                        error: err.to_string(),
                    };
                    send_frame(out_tx, frame).await?;
                }
            }
            ClientFrame::Ping { timestamp } => {
                *ping_deadline = Some(Instant::now() + 2 * self.settings.ping_interval);
                send_frame(out_tx, ServerFrame::Pong { timestamp }).await?;
            }
            ClientFrame::InputData { content } => {
                *pending_stdin = Some(content);
                send_frame(out_tx, ServerFrame::InputDataReceived).await?;
            }
            ClientFrame::ExecuteCode {
                code,
                input_data,
                language,
            } => {
                let job = ExecutionJob {
                    language: language.unwrap_or_else(|| "python".to_string()),
                    code,
                    stdin: input_data.or_else(|| pending_stdin.take()),
                    cwd: handle.workspace_path.clone(),
                    deadline: self.settings.execution_deadline,
                };
                let engine = self.engine.clone();
                let out_tx = out_tx.clone();
                exec_tasks.spawn(async move {
                    let frame = match engine.execute(job).await {
                        Ok(result) => ServerFrame::from_execution(&result),
                        Err(err) => ServerFrame::from_execution_error(&err),
                    };
                    let _ = send_frame(&out_tx, frame).await;
                });
            }
            ClientFrame::FileChange => {
                let workspaces = self.workspaces.clone();
                let handle = handle.clone();
                let out_tx = out_tx.clone();
                exec_tasks.spawn(async move {
                    // Pull repository-side edits onto disk first so the shell
                    // sees them, then push shell-side edits back and tell
                    // everyone what moved.
                    let session_id = handle.session_id;
                    if let Err(err) = workspaces.materialize(session_id).await {
                        let _ = send_frame(&out_tx, ServerFrame::error(&err)).await;
                        return;
                    }
                    match workspaces.sync_from_disk(session_id).await {
                        Ok(changes) => {
                            let frame = ServerFrame::FileSyncComplete {
                                message: "Files synced to workspace successfully".to_string(),
                            };
                            let _ = send_frame(&out_tx, frame).await;
                            for path in &changes.created {
                                handle.broadcast(ServerFrame::FileChange {
                                    file_path: path.clone(),
                                    kind: FileChangeKind::Created,
                                });
                            }
                            for path in &changes.updated {
                                handle.broadcast(ServerFrame::FileChange {
                                    file_path: path.clone(),
                                    kind: FileChangeKind::Updated,
                                });
                            }
                            for path in &changes.deleted {
                                handle.broadcast(ServerFrame::FileChange {
                                    file_path: path.clone(),
                                    kind: FileChangeKind::Deleted,
                                });
                            }
                        }
                        Err(err) => {
                            let _ = send_frame(&out_tx, ServerFrame::error(&err)).await;
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

/// Owns the socket write half. Exits after a close frame or a send failure.
async fn run_sender(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if ws_sender
                    .send(Message::Text(frame.to_json()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outbound::Close(code, reason) => {
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Copy PTY output into `shell_output` frames, aggregating into at most
/// `batch_window`/`batch_bytes` batches. When the outbound queue is full the
/// pump coalesces batches instead of dropping them; a queue that stays full
/// past the limit ends the connection with `BACKPRESSURE`.
async fn run_output_pump(
    mut output_rx: tokio::sync::broadcast::Receiver<String>,
    out_tx: mpsc::Sender<Outbound>,
    fatal_tx: mpsc::UnboundedSender<TerminusError>,
    batch_window: Duration,
    batch_bytes: usize,
) {
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    let mut pending = String::new();
    'pump: loop {
        if pending.is_empty() {
            match output_rx.recv().await {
                Ok(chunk) => pending.push_str(&chunk),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "output subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }

        // Aggregate whatever else arrives inside the window.
        let window_end = Instant::now() + batch_window;
        while pending.len() < batch_bytes {
            match timeout_at(window_end, output_rx.recv()).await {
                Ok(Ok(chunk)) => pending.push_str(&chunk),
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => {
                    flush_pending(&out_tx, &mut pending);
                    break 'pump;
                }
                Err(_) => break,
            }
        }

        let frame = ServerFrame::ShellOutput {
            data: std::mem::take(&mut pending),
        };
        match out_tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => break,
            Err(mpsc::error::TrySendError::Full(returned)) => {
                if let Outbound::Frame(ServerFrame::ShellOutput { data }) = returned {
                    pending = data;
                }
                let full_since = Instant::now();
                loop {
                    sleep(BACKPRESSURE_RETRY).await;
                    // Keep absorbing output while the queue is full so the
                    // coalesced batch stays current.
                    loop {
                        match output_rx.try_recv() {
                            Ok(chunk) => pending.push_str(&chunk),
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    let frame = ServerFrame::ShellOutput {
                        data: std::mem::take(&mut pending),
                    };
                    match out_tx.try_send(Outbound::Frame(frame)) {
                        Ok(()) => break,
                        Err(mpsc::error::TrySendError::Closed(_)) => break 'pump,
                        Err(mpsc::error::TrySendError::Full(returned)) => {
                            if let Outbound::Frame(ServerFrame::ShellOutput { data }) = returned {
                                pending = data;
                            }
                            if full_since.elapsed() >= BACKPRESSURE_LIMIT {
                                let _ = fatal_tx.send(TerminusError::Backpressure);
                                break 'pump;
                            }
                        }
                    }
                }
            }
        }
    }

    // The PTY is gone; if the socket is still up the connection ends with
    // the terminal, not silently.
    let _ = fatal_tx.send(TerminusError::pty("shell session ended"));
}

fn flush_pending(out_tx: &mpsc::Sender<Outbound>, pending: &mut String) {
    if !pending.is_empty() {
        let frame = ServerFrame::ShellOutput {
            data: std::mem::take(pending),
        };
        let _ = out_tx.try_send(Outbound::Frame(frame));
    }
}

/// Relay session-wide broadcast frames (file changes) to this connection.
async fn run_broadcast_relay(
    mut frames_rx: tokio::sync::broadcast::Receiver<ServerFrame>,
    out_tx: mpsc::Sender<Outbound>,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match frames_rx.recv().await {
            Ok(frame) => {
                if out_tx.send(Outbound::Frame(frame)).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

/// Queue a frame, treating a queue that stays full as backpressure. Frames
/// other than `shell_output` are never dropped.
async fn send_frame(
    out_tx: &mpsc::Sender<Outbound>,
    frame: ServerFrame,
) -> Result<(), TerminusError> {
    match timeout(SEND_TIMEOUT, out_tx.send(Outbound::Frame(frame))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(TerminusError::internal("connection writer gone")),
        Err(_) => Err(TerminusError::Backpressure),
    }
}
