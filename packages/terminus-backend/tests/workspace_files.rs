// Workspace manager behavior against a real directory tree.

use std::sync::Arc;

use tempfile::TempDir;

use terminus_backend::repository::Repository;
use terminus_backend::workspace::WorkspaceManager;

struct Fixture {
    manager: WorkspaceManager,
    repository: Arc<Repository>,
    session_id: i64,
    root: TempDir,
}

async fn fixture() -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let repository = Arc::new(Repository::new());
    let session = repository.create_session(1, "demo", None).await;
    let manager = WorkspaceManager::new(root.path().to_path_buf(), repository.clone());
    Fixture {
        manager,
        repository,
        session_id: session.id,
        root,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_read_round_trip() {
    let fx = fixture().await;
    fx.manager.materialize(fx.session_id).await.unwrap();

    let content = "print('hello')\n# second line\n";
    fx.manager
        .write_file(fx.session_id, "/src/main.py", content)
        .await
        .unwrap();

    let read_back = fx
        .manager
        .read_file(fx.session_id, "/src/main.py")
        .await
        .unwrap();
    assert_eq!(read_back, content);

    // Row was upserted too.
    let row = fx
        .repository
        .get_file(fx.session_id, "/src/main.py")
        .await
        .expect("row exists");
    assert_eq!(row.content, content);
    assert_eq!(row.name, "main.py");
    assert_eq!(row.file_type, "python");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn traversal_paths_are_rejected() {
    let fx = fixture().await;
    for bad in ["../escape.txt", "relative.txt", "/a/../../etc/passwd", "/"] {
        let err = fx
            .manager
            .write_file(fx.session_id, bad, "nope")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PATH_ERROR", "path: {bad}");
    }
    // Nothing escaped the root.
    assert!(!fx.root.path().join("escape.txt").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn materialize_writes_repository_rows() {
    let fx = fixture().await;
    fx.repository
        .upsert_file(fx.session_id, "/hello.txt", "hi there\n")
        .await;
    fx.repository
        .upsert_file(fx.session_id, "/nested/deep/file.py", "x = 1\n")
        .await;

    let dir = fx.manager.materialize(fx.session_id).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.join("hello.txt")).unwrap(),
        "hi there\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.join("nested/deep/file.py")).unwrap(),
        "x = 1\n"
    );

    // Idempotent.
    fx.manager.materialize(fx.session_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_reports_changes_then_goes_quiet() {
    let fx = fixture().await;
    let dir = fx.manager.materialize(fx.session_id).await.unwrap();

    // Shell-side edits.
    std::fs::write(dir.join("created.txt"), "fresh").unwrap();
    std::fs::create_dir_all(dir.join("pkg")).unwrap();
    std::fs::write(dir.join("pkg/mod.py"), "pass\n").unwrap();

    let changes = fx.manager.sync_from_disk(fx.session_id).await.unwrap();
    assert_eq!(changes.created, vec!["/created.txt", "/pkg/mod.py"]);
    assert!(changes.updated.is_empty());
    assert!(changes.deleted.is_empty());

    // Second pass with no intervening changes is empty.
    let changes = fx.manager.sync_from_disk(fx.session_id).await.unwrap();
    assert!(changes.is_empty(), "second sync: {changes:?}");

    // An edit shows up as an update, a removal as a delete.
    std::fs::write(dir.join("created.txt"), "changed").unwrap();
    std::fs::remove_file(dir.join("pkg/mod.py")).unwrap();
    let changes = fx.manager.sync_from_disk(fx.session_id).await.unwrap();
    assert_eq!(changes.updated, vec!["/created.txt"]);
    assert_eq!(changes.deleted, vec!["/pkg/mod.py"]);
    assert!(changes.created.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_files_never_reach_the_repository() {
    let fx = fixture().await;
    let dir = fx.manager.materialize(fx.session_id).await.unwrap();

    std::fs::write(dir.join("package.json"), "{}").unwrap();
    std::fs::write(dir.join("npm-debug.log"), "0 verbose cli").unwrap();
    std::fs::write(dir.join("build.log"), "log line").unwrap();
    std::fs::create_dir_all(dir.join("node_modules/x")).unwrap();
    std::fs::write(dir.join("node_modules/x/index.js"), "x").unwrap();
    std::fs::write(dir.join("kept.py"), "pass\n").unwrap();

    let changes = fx.manager.sync_from_disk(fx.session_id).await.unwrap();
    assert_eq!(changes.created, vec!["/kept.py"]);

    // Cleanup removes the clutter from disk but keeps real files.
    fx.manager.cleanup(fx.session_id).await.unwrap();
    assert!(!dir.join("package.json").exists());
    assert!(!dir.join("npm-debug.log").exists());
    assert!(!dir.join("build.log").exists());
    assert!(!dir.join("node_modules").exists());
    assert!(dir.join("kept.py").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_files_are_skipped_by_sync() {
    let fx = fixture().await;
    let dir = fx.manager.materialize(fx.session_id).await.unwrap();

    std::fs::write(dir.join("blob.bin"), [0u8, 159, 146, 150]).unwrap();
    std::fs::write(dir.join("text.txt"), "ok").unwrap();

    let changes = fx.manager.sync_from_disk(fx.session_id).await.unwrap();
    assert_eq!(changes.created, vec!["/text.txt"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_prunes_empty_directories() {
    let fx = fixture().await;
    let dir = fx.manager.materialize(fx.session_id).await.unwrap();

    fx.manager
        .write_file(fx.session_id, "/a/b/c/file.txt", "x")
        .await
        .unwrap();
    assert!(dir.join("a/b/c/file.txt").exists());

    let removed = fx
        .manager
        .delete_file(fx.session_id, "/a/b/c/file.txt")
        .await
        .unwrap();
    assert!(removed);
    assert!(!dir.join("a").exists(), "empty parents pruned");
    assert!(fx
        .repository
        .get_file(fx.session_id, "/a/b/c/file.txt")
        .await
        .is_none());

    // Deleting again is a no-op, not an error.
    let removed = fx
        .manager
        .delete_file(fx.session_id, "/a/b/c/file.txt")
        .await
        .unwrap();
    assert!(!removed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_missing_file_is_a_workspace_error() {
    let fx = fixture().await;
    fx.manager.materialize(fx.session_id).await.unwrap();
    let err = fx
        .manager
        .read_file(fx.session_id, "/ghost.txt")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKSPACE_ERROR");
}
