use crate::layout::InstallLayout;
use crate::StoreError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A single rollback step that undoes one publish side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStep {
    /// Remove a file this run placed.
    RemoveFile(PathBuf),
    /// Move a displaced file back from its backup location.
    RestoreBackup { backup: PathBuf, original: PathBuf },
    /// Remove a directory this run created, if it is empty again.
    RemoveDir(PathBuf),
}

/// A journal entry representing an in-flight publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub op_id: String,
    pub package: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Handle to an open journal entry.
///
/// Holds an exclusive lock on the entry's lock file for as long as the
/// publishing run lives, so recovery in another process can tell a crashed
/// run from a running one.
pub struct JournalOp {
    op_id: String,
    lock: File,
}

impl JournalOp {
    pub fn id(&self) -> &str {
        &self.op_id
    }
}

impl Drop for JournalOp {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

/// Write-ahead journal for publishing into the prefix.
///
/// The publisher opens an entry before touching the prefix, records each
/// rollback step before performing the matching side effect, and commits
/// the entry once every file is in place. Incomplete entries left by a
/// crashed run are rolled back by [`recover`](Self::recover).
pub struct PublishJournal {
    journal_dir: PathBuf,
}

impl PublishJournal {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            journal_dir: layout.journal_dir(),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.journal_dir)?;
        Ok(())
    }

    /// Begin a new entry for publishing `package`.
    pub fn begin(&self, package: &str) -> Result<JournalOp, StoreError> {
        fs::create_dir_all(&self.journal_dir)?;
        let now = chrono::Utc::now();
        let op_id = format!(
            "{}-{}-{}",
            now.format("%Y%m%d%H%M%S%6f"),
            std::process::id(),
            &blake3::hash(format!("{package}:{now:?}").as_bytes()).to_hex()[..8]
        );

        let lock = open_lock(&self.lock_path(&op_id))?;
        lock.lock_exclusive()?;

        let entry = JournalEntry {
            op_id: op_id.clone(),
            package: package.to_owned(),
            timestamp: now.to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("journal begin: {package} (op_id={op_id})");
        Ok(JournalOp { op_id, lock })
    }

    /// Append a rollback step. Must be called before the side effect it undoes.
    pub fn record(&self, op: &JournalOp, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(&op.op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)
    }

    /// Finish a successful publish: drop displaced backups and remove the entry.
    pub fn commit(&self, op: JournalOp) -> Result<(), StoreError> {
        let entry = self.read_entry(&op.op_id)?;
        for step in &entry.rollback_steps {
            if let RollbackStep::RestoreBackup { backup, .. } = step {
                if backup.exists() {
                    fs::remove_file(backup)?;
                }
            }
        }
        self.remove_entry(&op.op_id)?;
        debug!("journal commit: {}", op.op_id);
        Ok(())
    }

    /// Undo a failed publish in-process. Returns the number of steps replayed.
    pub fn rollback(&self, op: JournalOp) -> Result<usize, StoreError> {
        let entry = self.read_entry(&op.op_id)?;
        let count = entry.rollback_steps.len();
        rollback_entry(&entry);
        self.remove_entry(&op.op_id)?;
        info!("rolled back {count} publish steps for {}", entry.package);
        Ok(count)
    }

    /// List incomplete entries, oldest first. Corrupt entries are deleted.
    pub fn list_incomplete(&self) -> Result<Vec<JournalEntry>, StoreError> {
        if !self.journal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.journal_dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path)
                    .map_err(StoreError::from)
                    .and_then(|c| Ok(serde_json::from_str::<JournalEntry>(&c)?))
                {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!("corrupt journal entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back entries whose owning run is gone.
    ///
    /// Entries whose lock is still held belong to a live run and are skipped.
    /// Returns the number of entries rolled back.
    pub fn recover(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.list_incomplete()? {
            let lock = open_lock(&self.lock_path(&entry.op_id))?;
            if lock.try_lock_exclusive().is_err() {
                debug!("journal entry {} is owned by a live run", entry.op_id);
                continue;
            }
            info!(
                "journal recovery: rolling back publish of {} (op_id={})",
                entry.package, entry.op_id
            );
            rollback_entry(&entry);
            self.remove_entry(&entry.op_id)?;
            let _ = lock.unlock();
            count += 1;
        }
        if count > 0 {
            info!("journal recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.journal_dir.join(format!("{op_id}.json"))
    }

    fn lock_path(&self, op_id: &str) -> PathBuf {
        self.journal_dir.join(format!("{op_id}.lock"))
    }

    fn remove_entry(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let _ = fs::remove_file(self.lock_path(op_id));
        crate::fsync_dir(&self.journal_dir)?;
        Ok(())
    }

    fn write_entry(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.journal_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let dest = self.entry_path(&entry.op_id);
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.journal_dir)?;
        Ok(())
    }

    fn read_entry(&self, op_id: &str) -> Result<JournalEntry, StoreError> {
        let path = self.entry_path(op_id);
        if !path.exists() {
            return Err(StoreError::JournalEntryNotFound(op_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn open_lock(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

fn rollback_entry(entry: &JournalEntry) {
    for step in entry.rollback_steps.iter().rev() {
        match step {
            RollbackStep::RemoveFile(path) => {
                if path.symlink_metadata().is_ok() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!("rollback: failed to remove {}: {e}", path.display());
                    } else {
                        debug!("rollback: removed {}", path.display());
                    }
                }
            }
            RollbackStep::RestoreBackup { backup, original } => {
                if backup.exists() {
                    if let Err(e) = fs::rename(backup, original) {
                        warn!(
                            "rollback: failed to restore {} from {}: {e}",
                            original.display(),
                            backup.display()
                        );
                    } else {
                        debug!("rollback: restored {}", original.display());
                    }
                }
            }
            RollbackStep::RemoveDir(path) => {
                // Only empty directories: anything else was there before or belongs to someone else.
                if path.is_dir() {
                    if let Err(e) = fs::remove_dir(path) {
                        debug!("rollback: kept dir {}: {e}", path.display());
                    } else {
                        debug!("rollback: removed dir {}", path.display());
                    }
                }
            }
        }
    }
}
