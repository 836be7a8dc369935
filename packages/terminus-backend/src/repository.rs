//! In-memory reference implementation of the external persistence layer.
//!
//! The production deployment stores sessions and files in a relational
//! database behind the same interface; the backend only ever sees this CRUD
//! surface. Keeping the reference implementation in-process lets the server
//! run self-contained and keeps the tests honest about what the repository
//! contract actually is.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_accessed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFileRecord {
    pub id: i64,
    pub session_id: i64,
    /// Absolute logical path within the session root, `/`-separated.
    pub path: String,
    /// Last path segment.
    pub name: String,
    pub content: String,
    pub file_type: String,
    pub size_bytes: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default)]
pub struct Repository {
    sessions: RwLock<HashMap<i64, SessionRecord>>,
    files: RwLock<HashMap<i64, CodeFileRecord>>,
    next_session_id: AtomicI64,
    next_file_id: AtomicI64,
}

impl Repository {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            files: RwLock::new(HashMap::new()),
            next_session_id: AtomicI64::new(1),
            next_file_id: AtomicI64::new(1),
        }
    }

    pub async fn create_session(
        &self,
        user_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> SessionRecord {
        let now = now_millis();
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let record = SessionRecord {
            id,
            user_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        };
        self.sessions.write().await.insert(id, record.clone());
        record
    }

    pub async fn get_session(&self, session_id: i64) -> Option<SessionRecord> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn touch_session(&self, session_id: i64) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.last_accessed_at = now_millis();
        }
    }

    pub async fn delete_session(&self, session_id: i64) -> bool {
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            self.files
                .write()
                .await
                .retain(|_, file| file.session_id != session_id);
        }
        removed
    }

    /// All files of a session, ordered by path.
    pub async fn list_files(&self, session_id: i64) -> Vec<CodeFileRecord> {
        let mut files: Vec<CodeFileRecord> = self
            .files
            .read()
            .await
            .values()
            .filter(|file| file.session_id == session_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    pub async fn get_file(&self, session_id: i64, path: &str) -> Option<CodeFileRecord> {
        self.files
            .read()
            .await
            .values()
            .filter(|file| file.session_id == session_id && file.path == path)
            .max_by_key(|file| file.updated_at)
            .cloned()
    }

    /// Insert or update the row for `(session_id, path)`. Returns the stored
    /// record and whether a new row was created.
    pub async fn upsert_file(
        &self,
        session_id: i64,
        path: &str,
        content: &str,
    ) -> (CodeFileRecord, bool) {
        let now = now_millis();
        let name = file_name(path);
        let mut files = self.files.write().await;
        let existing = files
            .values_mut()
            .find(|file| file.session_id == session_id && file.path == path);
        if let Some(file) = existing {
            file.content = content.to_string();
            file.size_bytes = content.len() as u64;
            file.updated_at = now;
            return (file.clone(), false);
        }
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let record = CodeFileRecord {
            id,
            session_id,
            path: path.to_string(),
            name: name.clone(),
            content: content.to_string(),
            file_type: file_type_for(&name),
            size_bytes: content.len() as u64,
            created_at: now,
            updated_at: now,
        };
        files.insert(id, record.clone());
        (record, true)
    }

    pub async fn delete_file(&self, session_id: i64, path: &str) -> bool {
        let mut files = self.files.write().await;
        let ids: Vec<i64> = files
            .values()
            .filter(|file| file.session_id == session_id && file.path == path)
            .map(|file| file.id)
            .collect();
        for id in &ids {
            files.remove(id);
        }
        !ids.is_empty()
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Editor file-type tag derived from the extension.
pub fn file_type_for(name: &str) -> String {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "html" | "htm" => "html",
        "css" => "css",
        "json" => "json",
        "md" | "markdown" => "markdown",
        "yaml" | "yml" => "yaml",
        "xml" => "xml",
        "sh" | "bash" => "shell",
        _ => "text",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let repo = Repository::new();
        let session = repo.create_session(1, "demo", None).await;

        let (created, is_new) = repo.upsert_file(session.id, "/main.py", "print(1)").await;
        assert!(is_new);
        assert_eq!(created.name, "main.py");
        assert_eq!(created.file_type, "python");
        assert_eq!(created.size_bytes, 8);

        let (updated, is_new) = repo.upsert_file(session.id, "/main.py", "print(2)").await;
        assert!(!is_new);
        assert_eq!(updated.id, created.id);

        assert_eq!(repo.list_files(session.id).await.len(), 1);
    }

    #[tokio::test]
    async fn delete_session_cascades_to_files() {
        let repo = Repository::new();
        let session = repo.create_session(1, "demo", None).await;
        repo.upsert_file(session.id, "/a.txt", "a").await;
        repo.upsert_file(session.id, "/b.txt", "b").await;

        assert!(repo.delete_session(session.id).await);
        assert!(repo.list_files(session.id).await.is_empty());
    }

    #[test]
    fn file_types_cover_common_extensions() {
        assert_eq!(file_type_for("script.py"), "python");
        assert_eq!(file_type_for("notes.md"), "markdown");
        assert_eq!(file_type_for("run.sh"), "shell");
        assert_eq!(file_type_for("data"), "text");
    }
}
