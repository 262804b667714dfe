//! Integration tests for the state store: cross-repository flows and the
//! accounting invariants the engine depends on.

use cloudpull_core::Database;
use cloudpull_core::store::{
    FileStatus, FolderStatus, ItemType, NewErrorRecord, NewFile, NewFolder, ProgressDelta,
    SessionStatus, StateStore, StoreError,
};
use cloudpull_core::{SyncError, SyncErrorKind};

async fn store() -> StateStore {
    StateStore::new(Database::new_in_memory().await.unwrap())
}

struct Tree {
    store: StateStore,
    session_id: i64,
    folder_id: i64,
}

async fn seeded_tree() -> Tree {
    let store = store().await;
    let session = store.sessions().create("root", "My Drive", "/mnt/mirror").await.unwrap();
    let folder = store
        .folders()
        .insert(
            &NewFolder {
                remote_id: "folder-1".to_string(),
                parent_id: None,
                session_id: session.id,
                name: "docs".to_string(),
                path: "docs".to_string(),
            },
            FolderStatus::Scanning,
        )
        .await
        .unwrap();
    Tree {
        store,
        session_id: session.id,
        folder_id: folder.id,
    }
}

fn new_file(tree: &Tree, remote_id: &str, size: i64) -> NewFile {
    NewFile {
        remote_id: remote_id.to_string(),
        folder_id: tree.folder_id,
        session_id: tree.session_id,
        name: format!("{remote_id}.bin"),
        path: format!("docs/{remote_id}.bin"),
        size,
        md5_checksum: None,
        content_type: Some("application/octet-stream".to_string()),
        is_native_document: false,
        export_content_type: None,
        remote_modified_at: None,
    }
}

/// Accounting closure: after every file settles, completed + failed +
/// skipped equals total, and completed bytes never exceed total bytes.
#[tokio::test]
async fn accounting_closes_when_all_files_settle() {
    let tree = seeded_tree().await;
    let files = tree
        .store
        .files()
        .insert_batch(&[
            new_file(&tree, "a", 100),
            new_file(&tree, "b", 200),
            new_file(&tree, "c", 300),
            new_file(&tree, "d", 400),
        ])
        .await
        .unwrap()
        .records;

    tree.store
        .files()
        .complete_file(files[0].id, tree.session_id, 100, 100)
        .await
        .unwrap();
    tree.store
        .files()
        .complete_file(files[1].id, tree.session_id, 200, 200)
        .await
        .unwrap();
    tree.store
        .files()
        .fail_file(files[2].id, tree.session_id, "remote said no")
        .await
        .unwrap();
    tree.store
        .files()
        .skip_file(files[3].id, tree.session_id)
        .await
        .unwrap();

    let session = tree.store.sessions().get(tree.session_id).await.unwrap();
    assert_eq!(
        session.completed_files + session.failed_files + session.skipped_files,
        session.total_files
    );
    assert_eq!(session.completed_bytes, 300);
    assert!(session.completed_bytes <= session.total_bytes);
}

/// The progress-delta operation is exactly invertible.
#[tokio::test]
async fn progress_delta_round_trip_restores_counters() {
    let tree = seeded_tree().await;
    let delta = ProgressDelta {
        total_files: 7,
        completed_files: 2,
        failed_files: 1,
        skipped_files: 1,
        total_bytes: 9000,
        completed_bytes: 2500,
    };
    tree.store
        .sessions()
        .apply_progress_delta(tree.session_id, delta)
        .await
        .unwrap();
    tree.store
        .sessions()
        .apply_progress_delta(
            tree.session_id,
            ProgressDelta {
                total_files: -7,
                completed_files: -2,
                failed_files: -1,
                skipped_files: -1,
                total_bytes: -9000,
                completed_bytes: -2500,
            },
        )
        .await
        .unwrap();

    let session = tree.store.sessions().get(tree.session_id).await.unwrap();
    assert_eq!(session.total_files, 0);
    assert_eq!(session.completed_files, 0);
    assert_eq!(session.failed_files, 0);
    assert_eq!(session.skipped_files, 0);
    assert_eq!(session.total_bytes, 0);
    assert_eq!(session.completed_bytes, 0);
}

/// Resuming resets failed-under-cap files and failed folders, fixes the
/// session failed counter, and reactivates the session — atomically.
#[tokio::test]
async fn resume_session_resets_failures_and_counters() {
    let tree = seeded_tree().await;
    let files = tree
        .store
        .files()
        .insert_batch(&[new_file(&tree, "retryable", 10), new_file(&tree, "exhausted", 10)])
        .await
        .unwrap()
        .records;

    tree.store.files().mark_downloading(files[0].id).await.unwrap();
    for _ in 0..3 {
        tree.store.files().mark_downloading(files[1].id).await.unwrap();
    }
    tree.store
        .files()
        .fail_file(files[0].id, tree.session_id, "x")
        .await
        .unwrap();
    tree.store
        .files()
        .fail_file(files[1].id, tree.session_id, "y")
        .await
        .unwrap();
    tree.store
        .folders()
        .mark_failed(tree.folder_id, "listing broke")
        .await
        .unwrap();
    tree.store.sessions().pause(tree.session_id).await.unwrap();

    let (files_reset, folders_reset) = tree
        .store
        .sessions()
        .resume_session(tree.session_id, 3)
        .await
        .unwrap();
    assert_eq!(files_reset, 1, "only the under-cap file resets");
    assert_eq!(folders_reset, 1);

    let session = tree.store.sessions().get(tree.session_id).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Active);
    assert_eq!(session.failed_files, 1, "exhausted file stays failed");

    let folder = tree.store.folders().get(tree.folder_id).await.unwrap();
    assert_eq!(folder.status(), FolderStatus::Pending);
    assert!(folder.error_message.is_none());

    assert_eq!(
        tree.store.files().get(files[0].id).await.unwrap().status(),
        FileStatus::Pending
    );
}

/// Terminal sessions reject resume; a paused session accepts it twice.
#[tokio::test]
async fn resume_idempotence_and_terminal_rejection() {
    let tree = seeded_tree().await;
    tree.store.sessions().pause(tree.session_id).await.unwrap();

    tree.store.sessions().resume_session(tree.session_id, 3).await.unwrap();
    tree.store.sessions().resume_session(tree.session_id, 3).await.unwrap();

    tree.store.sessions().cancel(tree.session_id).await.unwrap();
    let result = tree.store.sessions().resume_session(tree.session_id, 3).await;
    assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
}

/// Error records survive with the full taxonomy fields.
#[tokio::test]
async fn error_log_keeps_audit_trail() {
    let tree = seeded_tree().await;
    let corruption = SyncError::corruption("checksum mismatch for docs/a.bin");
    tree.store
        .errors()
        .append(&NewErrorRecord::from_sync_error(
            tree.session_id,
            1,
            ItemType::File,
            &corruption,
            3,
        ))
        .await
        .unwrap();

    let records = tree.store.errors().recent(tree.session_id, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_kind, SyncErrorKind::Corruption.as_str());
    assert!(records[0].is_retryable);
    assert_eq!(records[0].retry_count, 3);
    assert_eq!(records[0].item_type, "file");
}

/// Deleting a session cascades through folders, files, chunks, and the
/// error log.
#[tokio::test]
async fn session_delete_cascades_everywhere() {
    let tree = seeded_tree().await;
    let files = tree
        .store
        .files()
        .insert_batch(&[new_file(&tree, "a", 100)])
        .await
        .unwrap()
        .records;
    tree.store.chunks().plan(files[0].id, &[(0, 99)]).await.unwrap();
    tree.store
        .errors()
        .append(&NewErrorRecord::from_sync_error(
            tree.session_id,
            files[0].id,
            ItemType::File,
            &SyncError::network("x"),
            0,
        ))
        .await
        .unwrap();

    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(tree.session_id)
        .execute(tree.store.database().pool())
        .await
        .unwrap();

    for table in ["folders", "files", "download_chunks", "error_log"] {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(tree.store.database().pool())
            .await
            .unwrap();
        assert_eq!(count, 0, "{table} should be empty after cascade");
    }
}
