//! Process-wide index of live sessions.
//!
//! The registry is the single owner of PTY and workspace handles: it creates
//! them on first attach, hands out reference-counted handles to connections,
//! and tears them down once the last connection is gone and the session has
//! been quiet long enough. All mutating operations on one session are
//! serialized through a per-key lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use terminus_error::TerminusError;

use crate::auth::AuthenticatedUser;
use crate::config::Settings;
use crate::frames::ServerFrame;
use crate::pty::{PtySession, PtySupervisor};
use crate::repository::{now_millis, Repository};
use crate::workspace::WorkspaceManager;

const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Shared state for one live session: the PTY, the materialized workspace,
/// and a broadcast channel for frames that fan out to every subscriber of
/// the session (file-change notifications).
pub struct SessionHandle {
    pub session_id: i64,
    pub pty: Arc<PtySession>,
    pub workspace_path: PathBuf,
    frames: broadcast::Sender<ServerFrame>,
    refs: AtomicUsize,
    last_activity: AtomicI64,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl SessionHandle {
    pub fn subscribe_frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    /// Fan a frame out to every connection attached to this session.
    pub fn broadcast(&self, frame: ServerFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn connection_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    fn idle_millis(&self) -> i64 {
        let last = self
            .last_activity
            .load(Ordering::Relaxed)
            .max(self.pty.last_activity_millis());
        now_millis() - last
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Arc<SessionHandle>>>,
    key_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    repository: Arc<Repository>,
    workspaces: Arc<WorkspaceManager>,
    supervisor: PtySupervisor,
    settings: Arc<Settings>,
}

impl SessionRegistry {
    pub fn new(
        settings: Arc<Settings>,
        repository: Arc<Repository>,
        workspaces: Arc<WorkspaceManager>,
    ) -> Result<Arc<Self>, TerminusError> {
        let supervisor = PtySupervisor::new(settings.clone())?;
        Ok(Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            repository,
            workspaces,
            supervisor,
            settings,
        }))
    }

    /// Periodically destroy sessions that have no connections and have been
    /// idle past the TTL. The workspace stays on disk; only the shell dies.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.settings.reaper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reap_idle_once().await;
            }
        })
    }

    /// Attach to a session, creating its PTY and workspace if this is the
    /// first connection. Increments the connection count.
    pub async fn acquire(
        &self,
        session_id: i64,
        user: &AuthenticatedUser,
    ) -> Result<Arc<SessionHandle>, TerminusError> {
        let session = self
            .repository
            .get_session(session_id)
            .await
            .ok_or(TerminusError::SessionNotFound { session_id })?;
        if !user.may_access(&session) {
            return Err(TerminusError::auth("not authorized for this session"));
        }

        let key_lock = self.key_lock(session_id).await;
        let _guard = key_lock.lock().await;

        let existing = self.sessions.read().await.get(&session_id).cloned();
        if let Some(handle) = existing {
            if handle.pty.is_alive().await {
                handle.refs.fetch_add(1, Ordering::SeqCst);
                handle.touch();
                self.repository.touch_session(session_id).await;
                return Ok(handle);
            }
            // Shell died underneath us; replace it.
            debug!(session_id, "replacing dead pty session");
            handle.pty.kill(self.settings.pty_kill_grace).await;
            self.sessions.write().await.remove(&session_id);
        }

        let workspace_path = self.workspaces.materialize(session_id).await?;
        let pty = self
            .supervisor
            .spawn(session_id, &workspace_path, &HashMap::new())?;
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let handle = Arc::new(SessionHandle {
            session_id,
            pty,
            workspace_path,
            frames,
            refs: AtomicUsize::new(1),
            last_activity: AtomicI64::new(now_millis()),
        });
        self.sessions
            .write()
            .await
            .insert(session_id, handle.clone());
        self.repository.touch_session(session_id).await;
        info!(session_id, user_id = user.user_id, "session attached");
        Ok(handle)
    }

    /// Drop one connection reference. Teardown is left to the reaper so a
    /// reconnecting client finds its shell still warm.
    pub async fn release(&self, session_id: i64) {
        if let Some(handle) = self.sessions.read().await.get(&session_id) {
            let previous = handle.refs.fetch_sub(1, Ordering::SeqCst);
            if previous == 0 {
                // Underflow guard; release without acquire is a bug upstream.
                handle.refs.store(0, Ordering::SeqCst);
                warn!(session_id, "release without matching acquire");
            }
            handle.touch();
        }
    }

    /// Handle lookup without touching the reference count.
    pub async fn lookup(&self, session_id: i64) -> Result<Arc<SessionHandle>, TerminusError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(TerminusError::SessionNotFound { session_id })
    }

    /// Kill the PTY and forget the session. Removes the workspace as well
    /// when the session itself was deleted from the repository.
    pub async fn destroy(
        &self,
        session_id: i64,
        remove_workspace: bool,
    ) -> Result<(), TerminusError> {
        let key_lock = self.key_lock(session_id).await;
        let _guard = key_lock.lock().await;

        let removed = self.sessions.write().await.remove(&session_id);
        if let Some(handle) = removed {
            handle.pty.kill(self.settings.pty_kill_grace).await;
        }
        if remove_workspace {
            self.workspaces.destroy(session_id).await?;
        }
        Ok(())
    }

    /// One reaper pass; exposed separately so tests can drive it directly.
    pub async fn reap_idle_once(&self) {
        let ttl_millis = self.settings.idle_session_ttl.as_millis() as i64;
        let candidates: Vec<Arc<SessionHandle>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|handle| handle.connection_count() == 0 && handle.idle_millis() >= ttl_millis)
            .cloned()
            .collect();

        for handle in candidates {
            let key_lock = self.key_lock(handle.session_id).await;
            let _guard = key_lock.lock().await;
            // Re-check under the key lock; a connection may have attached in
            // the meantime.
            if handle.connection_count() > 0 || handle.idle_millis() < ttl_millis {
                continue;
            }
            info!(session_id = handle.session_id, "reaping idle session");
            handle.pty.kill(self.settings.pty_kill_grace).await;
            self.sessions.write().await.remove(&handle.session_id);
        }
    }

    pub async fn live_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn key_lock(&self, session_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    fn test_settings(root: &std::path::Path) -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.workspace_root = root.to_path_buf();
        settings.pty_kill_grace = std::time::Duration::from_millis(500);
        Arc::new(settings)
    }

    fn owner() -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: 1,
            username: "alice".to_string(),
            role: Role::User,
        }
    }

    async fn registry_with_session(
        root: &std::path::Path,
    ) -> (Arc<SessionRegistry>, i64, Arc<Repository>) {
        let settings = test_settings(root);
        let repository = Arc::new(Repository::new());
        let session = repository.create_session(1, "demo", None).await;
        let workspaces = Arc::new(WorkspaceManager::new(
            settings.workspace_root.clone(),
            repository.clone(),
        ));
        let registry = SessionRegistry::new(settings, repository.clone(), workspaces).unwrap();
        (registry, session.id, repository)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_share_one_pty() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, session_id, _repo) = registry_with_session(dir.path()).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let user = owner();
            tasks.push(tokio::spawn(async move {
                registry.acquire(session_id, &user).await.unwrap()
            }));
        }
        let handles: Vec<Arc<SessionHandle>> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|res| res.unwrap())
            .collect();

        // Every acquire saw the same PTY.
        assert_eq!(registry.live_session_count().await, 1);
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0].pty, &handle.pty));
        }
        assert_eq!(handles[0].connection_count(), 8);

        for _ in 0..8 {
            registry.release(session_id).await;
        }
        assert_eq!(handles[0].connection_count(), 0);

        registry.destroy(session_id, false).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _session_id, _repo) = registry_with_session(dir.path()).await;
        let err = registry.acquire(9999, &owner()).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn foreign_user_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, session_id, _repo) = registry_with_session(dir.path()).await;
        let stranger = AuthenticatedUser {
            user_id: 42,
            username: "mallory".to_string(),
            role: Role::User,
        };
        let err = registry.acquire(session_id, &stranger).await.unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reaper_skips_sessions_with_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, session_id, _repo) = registry_with_session(dir.path()).await;

        let handle = registry.acquire(session_id, &owner()).await.unwrap();
        registry.reap_idle_once().await;
        assert_eq!(registry.live_session_count().await, 1);
        drop(handle);

        registry.release(session_id).await;
        // Still within the TTL, so the session survives a pass.
        registry.reap_idle_once().await;
        assert_eq!(registry.live_session_count().await, 1);

        registry.destroy(session_id, false).await.unwrap();
        assert_eq!(registry.live_session_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroy_can_retain_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, session_id, repo) = registry_with_session(dir.path()).await;
        repo.upsert_file(session_id, "/keep.txt", "kept").await;

        registry.acquire(session_id, &owner()).await.unwrap();
        registry.release(session_id).await;

        let workspace = dir.path().join(session_id.to_string());
        assert!(workspace.join("keep.txt").exists());

        registry.destroy(session_id, false).await.unwrap();
        assert!(workspace.join("keep.txt").exists(), "workspace retained");

        registry.destroy(session_id, true).await.unwrap();
        assert!(!workspace.exists(), "workspace removed with the session");
    }
}
