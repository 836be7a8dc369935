//! Per-session workspace management.
//!
//! A workspace is the on-disk mirror of a session's repository-backed file
//! tree: `workspace_root/<session_id>/<logical path>`. The manager
//! materializes the tree before a shell attaches, keeps database and disk in
//! sync under concurrent access, and enforces the path rules that keep a
//! session inside its own directory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use terminus_error::TerminusError;

use crate::repository::Repository;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Head signatures of npm log files; files starting with one of these are
/// never synced into the repository.
const NPM_LOG_SIGNATURES: [&str; 3] = ["0 verbose cli", "npm ERR!", "timing npm:load:"];

/// Result of a disk→repository sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

pub struct WorkspaceManager {
    root: PathBuf,
    repository: Arc<Repository>,
    path_locks: Mutex<HashMap<(i64, String), Arc<Mutex<()>>>>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, repository: Arc<Repository>) -> Self {
        Self {
            root,
            repository,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_dir(&self, session_id: i64) -> PathBuf {
        self.root.join(session_id.to_string())
    }

    /// Make the session's logical file tree exist on disk. Idempotent; rows
    /// that duplicate a path (legacy data) materialize only the newest.
    pub async fn materialize(&self, session_id: i64) -> Result<PathBuf, TerminusError> {
        let dir = self.session_dir(session_id);
        create_workspace_dir(&dir)?;

        let files = self.repository.list_files(session_id).await;
        let mut newest: HashMap<String, crate::repository::CodeFileRecord> = HashMap::new();
        for file in files {
            match newest.get(&file.path) {
                Some(existing) if existing.updated_at >= file.updated_at => {}
                _ => {
                    newest.insert(file.path.clone(), file);
                }
            }
        }

        for (path, file) in newest {
            let rel = match validate_path(&path) {
                Ok(rel) => rel,
                Err(err) => {
                    warn!(session_id, path, %err, "skipping row with invalid path");
                    continue;
                }
            };
            if is_ignored(&rel) {
                continue;
            }
            let lock = self.path_lock(session_id, &rel).await;
            let _guard = lock.lock().await;
            let target = dir.join(&rel);
            let content = file.content.clone();
            tokio::task::spawn_blocking(move || atomic_write(&target, content.as_bytes()))
                .await
                .map_err(|err| TerminusError::internal(err.to_string()))?
                .map_err(|err| workspace_error(&path, err))?;
        }

        debug!(session_id, dir = %dir.display(), "workspace materialized");
        Ok(dir)
    }

    /// Atomic write to disk plus repository upsert.
    pub async fn write_file(
        &self,
        session_id: i64,
        path: &str,
        content: &str,
    ) -> Result<(), TerminusError> {
        let rel = validate_path(path)?;
        let lock = self.path_lock(session_id, &rel).await;
        let _guard = lock.lock().await;
        let target = self.session_dir(session_id).join(&rel);

        // One retry on a failed write; anything past that is the caller's
        // problem.
        if let Err(first) = atomic_write(&target, content.as_bytes()) {
            debug!(path, %first, "retrying workspace write");
            atomic_write(&target, content.as_bytes()).map_err(|err| workspace_error(path, err))?;
        }
        self.repository.upsert_file(session_id, path, content).await;
        Ok(())
    }

    pub async fn read_file(&self, session_id: i64, path: &str) -> Result<String, TerminusError> {
        let rel = validate_path(path)?;
        let target = self.session_dir(session_id).join(&rel);
        fs::read_to_string(&target).map_err(|err| workspace_error(path, err))
    }

    /// Remove the file from both disk and repository, pruning any directories
    /// the deletion leaves empty.
    pub async fn delete_file(&self, session_id: i64, path: &str) -> Result<bool, TerminusError> {
        let rel = validate_path(path)?;
        let lock = self.path_lock(session_id, &rel).await;
        let _guard = lock.lock().await;
        let dir = self.session_dir(session_id);
        let target = dir.join(&rel);

        let existed_on_disk = target.exists();
        if existed_on_disk {
            fs::remove_file(&target).map_err(|err| workspace_error(path, err))?;
            prune_empty_dirs(target.parent(), &dir);
        }
        let existed_in_repo = self.repository.delete_file(session_id, path).await;
        Ok(existed_on_disk || existed_in_repo)
    }

    /// Scan the workspace tree and reconcile the repository with it: upsert
    /// rows for changed or new files, delete rows whose disk counterpart is
    /// gone. Ignored, binary, and npm-log files never reach the repository.
    pub async fn sync_from_disk(&self, session_id: i64) -> Result<ChangeSet, TerminusError> {
        let dir = self.session_dir(session_id);
        let disk_files = tokio::task::spawn_blocking(move || scan_tree(&dir))
            .await
            .map_err(|err| TerminusError::internal(err.to_string()))?
            .map_err(|err| TerminusError::workspace(err.to_string()))?;

        let rows = self.repository.list_files(session_id).await;
        let row_hashes: HashMap<String, [u8; 32]> = rows
            .iter()
            .map(|row| (row.path.clone(), content_hash(&row.content)))
            .collect();

        let mut change_set = ChangeSet::default();
        let mut seen: HashSet<String> = HashSet::new();
        for (rel, content) in disk_files {
            let logical = format!("/{rel}");
            seen.insert(logical.clone());
            match row_hashes.get(&logical) {
                Some(hash) if *hash == content_hash(&content) => {}
                Some(_) => {
                    self.repository
                        .upsert_file(session_id, &logical, &content)
                        .await;
                    change_set.updated.push(logical);
                }
                None => {
                    self.repository
                        .upsert_file(session_id, &logical, &content)
                        .await;
                    change_set.created.push(logical);
                }
            }
        }

        for row in rows {
            if !seen.contains(&row.path) {
                self.repository.delete_file(session_id, &row.path).await;
                change_set.deleted.push(row.path);
            }
        }

        change_set.created.sort();
        change_set.updated.sort();
        change_set.deleted.sort();
        Ok(change_set)
    }

    /// Delete ignore-set files from both disk and repository. Safe to call
    /// repeatedly.
    pub async fn cleanup(&self, session_id: i64) -> Result<(), TerminusError> {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            let dir_clone = dir.clone();
            tokio::task::spawn_blocking(move || remove_ignored(&dir_clone, &dir_clone))
                .await
                .map_err(|err| TerminusError::internal(err.to_string()))?
                .map_err(|err| TerminusError::workspace(err.to_string()))?;
        }

        for row in self.repository.list_files(session_id).await {
            let rel = row.path.trim_start_matches('/');
            if is_ignored(rel) {
                self.repository.delete_file(session_id, &row.path).await;
            }
        }
        Ok(())
    }

    /// Remove the workspace directory entirely. Only called when the session
    /// itself is deleted.
    pub async fn destroy(&self, session_id: i64) -> Result<(), TerminusError> {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|err| TerminusError::workspace(err.to_string()))?;
        }
        Ok(())
    }

    async fn path_lock(&self, session_id: i64, rel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry((session_id, rel.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Validate a logical path and return its normalized relative form.
///
/// A path must start with `/`, contain no `..` components, and resolve to a
/// descendant of the session root. This is the security boundary between a
/// session and the rest of the filesystem.
pub fn validate_path(path: &str) -> Result<String, TerminusError> {
    if !path.starts_with('/') {
        return Err(TerminusError::PathError {
            path: path.to_string(),
            message: "path must be absolute within the session root".to_string(),
        });
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                return Err(TerminusError::PathError {
                    path: path.to_string(),
                    message: "parent traversal is not allowed".to_string(),
                })
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(TerminusError::PathError {
            path: path.to_string(),
            message: "path names no file".to_string(),
        });
    }
    Ok(parts.join("/"))
}

/// Files excluded from the virtual tree and from sync in both directions.
pub fn is_ignored(rel_path: &str) -> bool {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    name == "package.json"
        || rel_path.contains("node_modules")
        || rel_path.contains(".npm")
        || name.ends_with(".log")
        || name.contains("npm-debug")
}

fn content_hash(content: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

fn workspace_error(path: &str, err: io::Error) -> TerminusError {
    TerminusError::Workspace {
        message: format!("{path}: {err}"),
    }
}

fn create_workspace_dir(dir: &Path) -> Result<(), TerminusError> {
    fs::create_dir_all(dir).map_err(|err| TerminusError::workspace(err.to_string()))?;
    let perms = fs::Permissions::from_mode(0o755);
    fs::set_permissions(dir, perms).map_err(|err| TerminusError::workspace(err.to_string()))?;
    Ok(())
}

/// Write-to-temp-then-rename so a running shell never observes a partial
/// file.
fn atomic_write(target: &Path, content: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    let tmp = parent.join(format!(
        ".{name}.tmp{}",
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, content)?;
    match fs::rename(&tmp, target) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}

fn prune_empty_dirs(start: Option<&Path>, stop: &Path) {
    let mut current = start;
    while let Some(dir) = current {
        if dir == stop {
            break;
        }
        match fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    if fs::remove_dir(dir).is_err() {
                        break;
                    }
                } else {
                    break;
                }
            }
            _ => break,
        }
        current = dir.parent();
    }
}

/// Collect `(relative path, content)` for every syncable file under `dir`.
/// Hidden files, `__pycache__`, the ignore set, binary files, and npm logs
/// are skipped.
fn scan_tree(dir: &Path) -> io::Result<Vec<(String, String)>> {
    let mut files = Vec::new();
    if dir.exists() {
        walk(dir, dir, &mut files)?;
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == "__pycache__" {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if name == "node_modules" {
                continue;
            }
            walk(root, &path, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if is_ignored(&rel) {
            continue;
        }
        let bytes = fs::read(&path)?;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                debug!(path = %path.display(), "skipping binary file during sync");
                continue;
            }
        };
        if looks_like_npm_log(&content) {
            continue;
        }
        out.push((rel, content));
    }
    Ok(())
}

fn looks_like_npm_log(content: &str) -> bool {
    let head: String = content.lines().take(10).collect::<Vec<_>>().join("\n");
    NPM_LOG_SIGNATURES
        .iter()
        .any(|signature| head.contains(signature))
}

/// Delete ignore-set files under `dir`, recursing into subdirectories.
fn remove_ignored(root: &Path, dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if file_type.is_dir() {
            if rel.contains("node_modules") || rel.contains(".npm") {
                fs::remove_dir_all(&path)?;
            } else {
                remove_ignored(root, &path)?;
            }
        } else if is_ignored(&rel) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation_rejects_traversal() {
        assert!(validate_path("/a/b.txt").is_ok());
        assert_eq!(validate_path("/a//b.txt").unwrap(), "a/b.txt");
        assert!(validate_path("relative.txt").is_err());
        assert!(validate_path("/../etc/passwd").is_err());
        assert!(validate_path("/a/../../b").is_err());
        assert!(validate_path("/").is_err());
    }

    #[test]
    fn ignore_set_matches_npm_artifacts() {
        assert!(is_ignored("package.json"));
        assert!(is_ignored("src/node_modules/x/index.js"));
        assert!(is_ignored(".npmrc"));
        assert!(is_ignored("build/output.log"));
        assert!(is_ignored("npm-debug-0.txt"));
        assert!(!is_ignored("main.py"));
        assert!(!is_ignored("src/app.js"));
    }

    #[test]
    fn npm_log_detection_reads_head_only() {
        assert!(looks_like_npm_log("0 verbose cli /usr/bin/node"));
        assert!(looks_like_npm_log("line\nnpm ERR! code E404\n"));
        assert!(!looks_like_npm_log("print('npm is a word here eventually')"));
    }
}
