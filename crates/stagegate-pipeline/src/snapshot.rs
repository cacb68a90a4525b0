//! Per-stage snapshots of execution context, files and table rows.
//!
//! Snapshots are keyed by stage id. Backup files live under a private root
//! directory, one subdirectory per snapshot. The index and the backup files
//! are only touched while holding the store's lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::model::Context;
use crate::table::{Row, TableStore};

/// Snapshots kept when no limit is configured.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Deep copy
// ─────────────────────────────────────────────────────────────────────────────

/// Structural copy of a JSON value. The result shares nothing with `value`.
pub fn deep_copy(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::Number(n.clone()),
        Value::String(s) => Value::String(s.clone()),
        Value::Array(items) => Value::Array(items.iter().map(deep_copy).collect()),
        Value::Object(map) => Value::Object(deep_copy_context(map)),
    }
}

/// Structural copy of a context map.
pub fn deep_copy_context(context: &Context) -> Context {
    context
        .iter()
        .map(|(k, v)| (k.clone(), deep_copy(v)))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot data
// ─────────────────────────────────────────────────────────────────────────────

/// One backed-up file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackup {
    pub original: PathBuf,
    pub backup: PathBuf,
    /// Hex SHA-256 of the file at capture time.
    pub checksum: String,
}

/// Captured state of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stage_id: String,
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    /// Creation sequence, breaks timestamp ties during eviction.
    pub seq: u64,
    pub context: Option<Context>,
    pub files: Option<Vec<FileBackup>>,
    pub database: Option<BTreeMap<String, Vec<Row>>>,
    pub backup_dir: PathBuf,
}

/// What to capture for a stage.
#[derive(Default)]
pub struct SnapshotRequest<'a> {
    pub context: Option<&'a Context>,
    pub files: Vec<PathBuf>,
    pub database: Option<&'a dyn TableStore>,
    pub tables: Vec<String>,
}

impl<'a> SnapshotRequest<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: &'a Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.files.extend(files);
        self
    }

    pub fn with_database(mut self, database: &'a dyn TableStore, tables: impl IntoIterator<Item = String>) -> Self {
        self.database = Some(database);
        self.tables.extend(tables);
        self
    }
}

/// Outcome of [`SnapshotStore::create_snapshot`]: one flag per sub-capture.
///
/// A flag is `true` only when that part was requested and fully captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotReceipt {
    pub stage_id: String,
    pub timestamp: DateTime<Utc>,
    pub context_captured: bool,
    pub files_captured: bool,
    pub database_captured: bool,
    /// Files that did not exist and were skipped.
    pub skipped_files: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Where restored database rows go.
#[derive(Default)]
pub struct RestoreTarget<'a> {
    pub database: Option<&'a dyn TableStore>,
}

impl<'a> RestoreTarget<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(database: &'a dyn TableStore) -> Self {
        Self {
            database: Some(database),
        }
    }
}

/// How a restored context is applied to the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Overwrite captured keys, keep keys added since.
    Merge,
    /// Discard the live context entirely.
    Replace,
}

/// Outcome of [`SnapshotStore::restore_snapshot`].
#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub stage_id: String,
    /// Deep copy of the captured context.
    pub context: Option<Context>,
    pub context_restored: bool,
    pub files_restored: bool,
    pub database_restored: bool,
    pub errors: Vec<String>,
}

impl RestoreResult {
    /// No sub-restore reported an error.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Apply the captured context to `target`. Returns `false` when the
    /// snapshot had no context.
    pub fn apply_context(&self, target: &mut Context, mode: RestoreMode) -> bool {
        let Some(ref captured) = self.context else {
            return false;
        };
        if mode == RestoreMode::Replace {
            target.clear();
        }
        for (key, value) in captured {
            target.insert(key.clone(), deep_copy(value));
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Index {
    snapshots: HashMap<String, Snapshot>,
    next_seq: u64,
}

/// Bounded set of per-stage snapshots with on-disk file backups.
pub struct SnapshotStore {
    root: PathBuf,
    max_snapshots: usize,
    index: Mutex<Index>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("root", &self.root)
            .field("max_snapshots", &self.max_snapshots)
            .field("len", &self.len())
            .finish()
    }
}

impl SnapshotStore {
    /// Store rooted at `root`. The directory is created on first use.
    pub fn new(root: impl Into<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            root: root.into(),
            max_snapshots: max_snapshots.max(1),
            index: Mutex::new(Index::default()),
        }
    }

    /// Store under a fresh, uniquely named directory in the system temp dir.
    pub fn in_temp_dir(max_snapshots: usize) -> Self {
        let root = std::env::temp_dir().join(format!("stagegate-snapshots-{}", uuid::Uuid::new_v4()));
        Self::new(root, max_snapshots)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    pub fn len(&self) -> usize {
        self.index.lock().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_snapshot(&self, stage_id: &str) -> bool {
        self.index.lock().snapshots.contains_key(stage_id)
    }

    pub fn get_snapshot(&self, stage_id: &str) -> Option<Snapshot> {
        self.index.lock().snapshots.get(stage_id).cloned()
    }

    /// All snapshots, oldest first.
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.index.lock().snapshots.values().cloned().collect();
        snapshots.sort_by_key(|s| (s.timestamp, s.seq));
        snapshots
    }

    /// Capture the requested state for a stage.
    ///
    /// Replaces any existing snapshot of the same stage, then evicts the
    /// oldest snapshots beyond the retention limit.
    pub fn create_snapshot(
        &self,
        stage_id: &str,
        stage_name: &str,
        request: SnapshotRequest<'_>,
    ) -> SnapshotReceipt {
        let mut index = self.index.lock();

        if let Some(old) = index.snapshots.remove(stage_id) {
            remove_backup_dir(&old);
        }

        let seq = index.next_seq;
        index.next_seq += 1;
        let timestamp = Utc::now();
        let backup_dir = self.root.join(format!("{}-{seq}", sanitize(stage_id)));
        let mut errors = Vec::new();
        let mut skipped_files = Vec::new();

        let context = request.context.map(deep_copy_context);
        let context_captured = context.is_some();

        let (files, files_captured) = if request.files.is_empty() {
            (None, false)
        } else {
            let mut backups = Vec::new();
            let mut ok = true;
            for (i, original) in request.files.iter().enumerate() {
                if !original.is_file() {
                    debug!(path = %original.display(), "Snapshot skipping missing file");
                    skipped_files.push(original.clone());
                    continue;
                }
                match backup_file(original, &backup_dir, i) {
                    Ok(backup) => backups.push(backup),
                    Err(e) => {
                        ok = false;
                        errors.push(format!("file {}: {e}", original.display()));
                    }
                }
            }
            (Some(backups), ok)
        };

        let (database, database_captured) = match request.database {
            Some(db) if !request.tables.is_empty() => {
                let mut tables = BTreeMap::new();
                let mut ok = true;
                for table in &request.tables {
                    match db.select_all(table) {
                        Ok(rows) => {
                            tables.insert(table.clone(), rows);
                        }
                        Err(e) => {
                            ok = false;
                            errors.push(format!("table {table}: {e}"));
                        }
                    }
                }
                (Some(tables), ok)
            }
            None if !request.tables.is_empty() => {
                errors.push("tables requested without a table store".to_string());
                (None, false)
            }
            _ => (None, false),
        };

        for error in &errors {
            warn!(stage_id, %error, "Snapshot capture incomplete");
        }

        index.snapshots.insert(
            stage_id.to_string(),
            Snapshot {
                stage_id: stage_id.to_string(),
                stage_name: stage_name.to_string(),
                timestamp,
                seq,
                context,
                files,
                database,
                backup_dir,
            },
        );
        info!(stage_id, seq, "Snapshot created");

        self.evict_over_limit(&mut index);

        SnapshotReceipt {
            stage_id: stage_id.to_string(),
            timestamp,
            context_captured,
            files_captured,
            database_captured,
            skipped_files,
            errors,
        }
    }

    /// Restore a stage's snapshot.
    ///
    /// The context comes back as a deep copy for the caller to apply. Files are
    /// checksum-verified and copied over their originals; tables are replaced
    /// one by one. Partial failures are collected, not raised.
    pub fn restore_snapshot(&self, stage_id: &str, target: RestoreTarget<'_>) -> Result<RestoreResult> {
        let index = self.index.lock();
        let snapshot = index
            .snapshots
            .get(stage_id)
            .ok_or_else(|| PipelineError::SnapshotNotFound(stage_id.to_string()))?;

        let mut errors = Vec::new();

        let context = snapshot.context.as_ref().map(deep_copy_context);
        let context_restored = context.is_some();

        let files_restored = match snapshot.files {
            Some(ref backups) => {
                let mut ok = true;
                for backup in backups {
                    if let Err(e) = restore_file(backup) {
                        ok = false;
                        errors.push(format!("file {}: {e}", backup.original.display()));
                    }
                }
                ok
            }
            None => false,
        };

        let database_restored = match (&snapshot.database, target.database) {
            (Some(tables), Some(db)) => {
                let mut ok = true;
                for (table, rows) in tables {
                    if let Err(e) = db.replace_rows(table, rows) {
                        ok = false;
                        errors.push(format!("table {table}: {e}"));
                    }
                }
                ok
            }
            (Some(_), None) => {
                errors.push("snapshot has tables but no table store was supplied".to_string());
                false
            }
            (None, _) => false,
        };

        if errors.is_empty() {
            info!(stage_id, "Snapshot restored");
        } else {
            warn!(stage_id, errors = errors.len(), "Snapshot restored with errors");
        }

        Ok(RestoreResult {
            stage_id: stage_id.to_string(),
            context,
            context_restored,
            files_restored,
            database_restored,
            errors,
        })
    }

    /// Like [`SnapshotStore::restore_snapshot`], but any partial failure
    /// becomes [`PipelineError::SnapshotRestoreFailed`].
    pub fn restore_snapshot_strict(&self, stage_id: &str, target: RestoreTarget<'_>) -> Result<RestoreResult> {
        let result = self.restore_snapshot(stage_id, target)?;
        if !result.is_complete() {
            return Err(PipelineError::SnapshotRestoreFailed {
                stage_id: stage_id.to_string(),
                message: result.errors.join("; "),
            });
        }
        Ok(result)
    }

    /// Recompute backup checksums. Returns the originals whose backups are
    /// missing or no longer match.
    pub fn verify_snapshot(&self, stage_id: &str) -> Result<Vec<PathBuf>> {
        let index = self.index.lock();
        let snapshot = index
            .snapshots
            .get(stage_id)
            .ok_or_else(|| PipelineError::SnapshotNotFound(stage_id.to_string()))?;

        Ok(snapshot
            .files
            .iter()
            .flatten()
            .filter(|b| !matches!(sha256_file(&b.backup), Ok(sum) if sum == b.checksum))
            .map(|b| b.original.clone())
            .collect())
    }

    /// Delete one snapshot and its backup files. Returns whether it existed.
    pub fn delete_snapshot(&self, stage_id: &str) -> bool {
        let mut index = self.index.lock();
        match index.snapshots.remove(stage_id) {
            Some(snapshot) => {
                remove_backup_dir(&snapshot);
                debug!(stage_id, "Snapshot deleted");
                true
            }
            None => false,
        }
    }

    /// Delete every snapshot and the root directory.
    pub fn cleanup_all(&self) -> Result<()> {
        let mut index = self.index.lock();
        for snapshot in index.snapshots.values() {
            remove_backup_dir(snapshot);
        }
        index.snapshots.clear();
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        info!(root = %self.root.display(), "Snapshot store cleaned up");
        Ok(())
    }

    fn evict_over_limit(&self, index: &mut Index) {
        while index.snapshots.len() > self.max_snapshots {
            let Some(oldest) = index
                .snapshots
                .values()
                .min_by_key(|s| (s.timestamp, s.seq))
                .map(|s| s.stage_id.clone())
            else {
                break;
            };
            if let Some(snapshot) = index.snapshots.get(&oldest) {
                remove_backup_dir(snapshot);
            }
            index.snapshots.remove(&oldest);
            debug!(stage_id = %oldest, "Snapshot evicted");
        }
    }
}

fn backup_file(original: &Path, backup_dir: &Path, position: usize) -> std::io::Result<FileBackup> {
    fs::create_dir_all(backup_dir)?;
    let file_name = original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let backup = backup_dir.join(format!("{position}-{file_name}"));
    fs::copy(original, &backup)?;
    let checksum = sha256_file(&backup)?;
    Ok(FileBackup {
        original: original.to_path_buf(),
        backup,
        checksum,
    })
}

fn restore_file(backup: &FileBackup) -> std::result::Result<(), String> {
    let actual = sha256_file(&backup.backup).map_err(|e| format!("backup unreadable: {e}"))?;
    if actual != backup.checksum {
        return Err("backup checksum mismatch".to_string());
    }
    if let Some(parent) = backup.original.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::copy(&backup.backup, &backup.original).map_err(|e| e.to_string())?;
    Ok(())
}

fn remove_backup_dir(snapshot: &Snapshot) {
    if !snapshot.backup_dir.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(&snapshot.backup_dir) {
        warn!(
            stage_id = %snapshot.stage_id,
            dir = %snapshot.backup_dir.display(),
            "Failed to remove snapshot backup: {e}"
        );
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Stage ids become directory names.
fn sanitize(stage_id: &str) -> String {
    stage_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
