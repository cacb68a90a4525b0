//! Integration tests for SnapshotStore.

use std::path::PathBuf;

use serde_json::json;
use stagegate_pipeline::{
    Context, RestoreMode, RestoreTarget, SnapshotRequest, SnapshotStore, SqliteTableStore,
    TableStore,
};

fn context_with(key: &str, value: serde_json::Value) -> Context {
    let mut ctx = Context::new();
    ctx.insert(key.to_string(), value);
    ctx
}

#[test]
fn test_context_restore_ignores_later_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("snaps"), 10);

    let mut live = context_with("config", json!({"retries": 3, "tags": ["a", "b"]}));
    let receipt = store.create_snapshot("build", "Build", SnapshotRequest::new().with_context(&live));
    assert!(receipt.context_captured);
    assert!(!receipt.files_captured);
    assert!(!receipt.database_captured);

    live["config"]["retries"] = json!(99);
    live["config"]["tags"].as_array_mut().unwrap().push(json!("c"));
    live.insert("added".into(), json!(true));

    let result = store.restore_snapshot("build", RestoreTarget::new()).unwrap();
    assert!(result.context_restored);
    assert_eq!(
        result.context.as_ref().unwrap()["config"],
        json!({"retries": 3, "tags": ["a", "b"]})
    );

    let mut merged = live.clone();
    result.apply_context(&mut merged, RestoreMode::Merge);
    assert_eq!(merged["config"]["retries"], json!(3));
    assert_eq!(merged["added"], json!(true));

    result.apply_context(&mut live, RestoreMode::Replace);
    assert!(!live.contains_key("added"));
}

#[test]
fn test_retention_evicts_oldest() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("source.txt");
    std::fs::write(&file, "content").unwrap();
    let store = SnapshotStore::new(dir.path().join("snaps"), 3);

    for stage in ["s1", "s2", "s3", "s4"] {
        let receipt = store.create_snapshot(stage, stage, SnapshotRequest::new().with_files([file.clone()]));
        assert!(receipt.files_captured);
    }

    let mut ids: Vec<_> = store.list_snapshots().into_iter().map(|s| s.stage_id).collect();
    ids.sort();
    assert_eq!(ids, vec!["s2", "s3", "s4"]);
    assert!(!store.has_snapshot("s1"));
    assert!(!dir.path().join("snaps").join("s1-0").exists());
    assert!(dir.path().join("snaps").join("s4-3").exists());
}

#[test]
fn test_file_restore_overwrites_changes() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("nested").join("b.txt");
    std::fs::create_dir_all(b.parent().unwrap()).unwrap();
    std::fs::write(&a, "alpha").unwrap();
    std::fs::write(&b, "beta").unwrap();

    let store = SnapshotStore::new(dir.path().join("snaps"), 5);
    let receipt = store.create_snapshot("edit", "Edit", SnapshotRequest::new().with_files([a.clone(), b.clone()]));
    assert!(receipt.files_captured);
    assert!(receipt.errors.is_empty());

    std::fs::write(&a, "changed").unwrap();
    std::fs::remove_file(&b).unwrap();
    assert!(store.verify_snapshot("edit").unwrap().is_empty());

    let result = store.restore_snapshot_strict("edit", RestoreTarget::new()).unwrap();
    assert!(result.files_restored);
    assert!(!result.context_restored);
    assert_eq!(std::fs::read_to_string(&a).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(&b).unwrap(), "beta");
}

#[test]
fn test_missing_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present.txt");
    let missing: PathBuf = dir.path().join("missing.txt");
    std::fs::write(&present, "here").unwrap();

    let store = SnapshotStore::new(dir.path().join("snaps"), 5);
    let receipt = store.create_snapshot(
        "stage",
        "Stage",
        SnapshotRequest::new().with_files([present.clone(), missing.clone()]),
    );

    assert!(receipt.files_captured);
    assert!(receipt.errors.is_empty());
    assert_eq!(receipt.skipped_files, vec![missing.clone()]);
    let snapshot = store.get_snapshot("stage").unwrap();
    assert_eq!(snapshot.files.as_ref().unwrap().len(), 1);

    let result = store.restore_snapshot("stage", RestoreTarget::new()).unwrap();
    assert!(result.is_complete());
    assert!(!missing.exists());
}

#[test]
fn test_table_restore_replaces_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = SqliteTableStore::open(dir.path().join("app.db")).unwrap();
    db.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, avatar BLOB);
         INSERT INTO users VALUES (1, 'ada', 9.5, x'0102');
         INSERT INTO users VALUES (2, 'grace', NULL, NULL);",
    )
    .unwrap();

    let store = SnapshotStore::new(dir.path().join("snaps"), 5);
    let receipt = store.create_snapshot(
        "migrate",
        "Migrate",
        SnapshotRequest::new().with_database(&db, ["users".to_string()]),
    );
    assert!(receipt.database_captured);

    db.execute_batch("DELETE FROM users WHERE id = 1; UPDATE users SET name = 'hopper' WHERE id = 2;")
        .unwrap();

    let result = store.restore_snapshot("migrate", RestoreTarget::with_database(&db)).unwrap();
    assert!(result.database_restored);
    assert!(result.is_complete());

    let rows = db.select_all("users").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], json!("ada"));
    assert_eq!(rows[0]["score"], json!(9.5));
    assert_eq!(rows[1]["name"], json!("grace"));
    assert!(rows[1]["score"].is_null());
}

#[test]
fn test_unknown_table_reports_error() {
    let db = SqliteTableStore::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("snaps"), 5);

    let receipt = store.create_snapshot(
        "s",
        "S",
        SnapshotRequest::new().with_database(&db, ["nope".to_string()]),
    );
    assert!(!receipt.database_captured);
    assert_eq!(receipt.errors.len(), 1);
    assert!(store.has_snapshot("s"));
}
