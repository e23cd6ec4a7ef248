use crate::concurrency::{CancellationToken, DestinationLocks};
use crate::CoreError;
use pallet_fetch::FetchedArchive;
use pallet_schema::{Destination, Manifest};
use pallet_store::{
    extract_archive, fsync_dir, source_root, InstallLayout, InstalledArtifact, JournalOp,
    PublishJournal, RollbackStep, Staging,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A staged file paired with the path it will be published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub step: usize,
    /// Path relative to the archive's source root, as named in the manifest.
    pub source: String,
    pub staged: PathBuf,
    pub destination: Destination,
    pub target: PathBuf,
    pub mode: u32,
}

/// Files published under a journal entry that is still open.
///
/// The destination locks stay held until the entry is committed. Dropping
/// this without calling [`commit`](Self::commit) rolls every published file
/// back, so work done between publish and commit (the receipt write) is part
/// of the same all-or-nothing step.
pub struct Published<'a> {
    journal: &'a PublishJournal,
    package: String,
    op: Option<JournalOp>,
    artifacts: Vec<InstalledArtifact>,
    _locks: DestinationLocks,
}

impl Published<'_> {
    pub fn artifacts(&self) -> &[InstalledArtifact] {
        &self.artifacts
    }

    /// Journal id of the open entry, for naming backups.
    pub fn op_id(&self) -> &str {
        self.op.as_ref().map_or("", JournalOp::id)
    }

    /// Journal an extra side effect, before performing it.
    pub fn record(&self, step: RollbackStep) -> Result<(), CoreError> {
        if let Some(op) = &self.op {
            self.journal.record(op, step)?;
        }
        Ok(())
    }

    /// Make the publish final and release the destination locks.
    pub fn commit(mut self) -> Result<Vec<InstalledArtifact>, CoreError> {
        if let Some(op) = self.op.take() {
            self.journal.commit(op)?;
        }
        info!("published {} files for {}", self.artifacts.len(), self.package);
        Ok(std::mem::take(&mut self.artifacts))
    }
}

impl Drop for Published<'_> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            warn!("publish of {} not committed; rolling back", self.package);
            if let Err(e) = self.journal.rollback(op) {
                warn!("rollback of {} incomplete: {e}", self.package);
            }
        }
    }
}

/// Places the contents of a verified archive into the install prefix.
///
/// Extraction happens in a scoped staging directory. Every install step is
/// resolved before anything is published, so a missing source or a clash
/// between two steps leaves the prefix untouched. Publishing is journaled
/// and rolled back as a whole on any failure, or when the returned
/// [`Published`] is dropped uncommitted.
pub struct InstallExecutor<'a> {
    layout: &'a InstallLayout,
    journal: &'a PublishJournal,
    cancel: &'a CancellationToken,
}

impl<'a> InstallExecutor<'a> {
    pub fn new(
        layout: &'a InstallLayout,
        journal: &'a PublishJournal,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            layout,
            journal,
            cancel,
        }
    }

    pub fn install(
        &self,
        manifest: &Manifest,
        archive: &FetchedArchive,
    ) -> Result<Published<'a>, CoreError> {
        let staging = Staging::acquire(self.layout)?;
        let kind = extract_archive(&archive.bytes, archive.file_name(), staging.path())?;
        debug!("extracted {} as {kind:?}", archive.file_name());

        let root = source_root(staging.path())?;
        let files = resolve(manifest, &root, self.layout)?;
        info!(
            "{}: {} files from {} install steps",
            manifest.name(),
            files.len(),
            manifest.install_steps().len()
        );

        self.cancel.check()?;
        let locks = DestinationLocks::acquire(
            &self.layout.locks_dir(),
            files.iter().map(|f| f.target.as_path()),
        )?;
        let published = self.publish(manifest.name(), &files, locks)?;

        if let Err(e) = staging.close() {
            warn!("failed to remove staging directory: {e}");
        }
        Ok(published)
    }

    fn publish(
        &self,
        package: &str,
        files: &[ResolvedFile],
        locks: DestinationLocks,
    ) -> Result<Published<'a>, CoreError> {
        self.journal.initialize()?;
        let op = self.journal.begin(package)?;
        match self.publish_all(&op, files) {
            Ok(artifacts) => Ok(Published {
                journal: self.journal,
                package: package.to_owned(),
                op: Some(op),
                artifacts,
                _locks: locks,
            }),
            Err(e) => {
                warn!("publishing {package} failed: {e}; rolling back");
                if let Err(rb) = self.journal.rollback(op) {
                    warn!("rollback of {package} incomplete: {rb}");
                }
                Err(e)
            }
        }
    }

    fn publish_all(
        &self,
        op: &JournalOp,
        files: &[ResolvedFile],
    ) -> Result<Vec<InstalledArtifact>, CoreError> {
        let mut artifacts = Vec::with_capacity(files.len());
        for file in files {
            self.cancel.check()?;
            self.publish_file(op, file)?;
            artifacts.push(InstalledArtifact {
                step: file.step,
                source: file.source.clone(),
                destination: file.destination,
                path: file.target.clone(),
                mode: file.mode,
            });
        }
        Ok(artifacts)
    }

    fn publish_file(&self, op: &JournalOp, file: &ResolvedFile) -> Result<(), CoreError> {
        let parent = file.target.parent().ok_or_else(|| {
            CoreError::Io(io::Error::other(format!(
                "destination {} has no parent directory",
                file.target.display()
            )))
        })?;
        self.create_dirs(op, parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".pallet-")
            .tempfile_in(parent)?;
        let mut src = fs::File::open(&file.staged)?;
        io::copy(&mut src, tmp.as_file_mut())?;
        set_mode(tmp.path(), file.mode)?;
        tmp.as_file().sync_all()?;

        match fs::symlink_metadata(&file.target) {
            Ok(meta) if meta.is_dir() => {
                return Err(CoreError::DestinationIsDirectory(file.target.clone()));
            }
            Ok(_) => {
                let backup = backup_path(&file.target, op.id());
                self.journal.record(
                    op,
                    RollbackStep::RestoreBackup {
                        backup: backup.clone(),
                        original: file.target.clone(),
                    },
                )?;
                fs::rename(&file.target, &backup)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.journal
            .record(op, RollbackStep::RemoveFile(file.target.clone()))?;
        tmp.persist(&file.target).map_err(|e| CoreError::Io(e.error))?;
        fsync_dir(parent)?;
        debug!("published {} ({:o})", file.target.display(), file.mode);
        Ok(())
    }

    /// Create `dir` and any missing ancestors, journaling each one first.
    fn create_dirs(&self, op: &JournalOp, dir: &Path) -> Result<(), CoreError> {
        let mut missing = Vec::new();
        let mut cur = Some(dir);
        while let Some(d) = cur {
            if d.exists() {
                break;
            }
            missing.push(d.to_path_buf());
            cur = d.parent();
        }
        for d in missing.into_iter().rev() {
            self.journal.record(op, RollbackStep::RemoveDir(d.clone()))?;
            match fs::create_dir(&d) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Resolve every install step against the extracted source root.
///
/// Directory sources expand to the files beneath them, placed under a
/// directory of the same name (or the rename) in the destination. Fails if
/// a source is missing, resolves outside the root (including via symlinks),
/// or if two steps would publish the same path.
pub fn resolve(
    manifest: &Manifest,
    root: &Path,
    layout: &InstallLayout,
) -> Result<Vec<ResolvedFile>, CoreError> {
    let canonical_root = root.canonicalize()?;
    let mut files = Vec::new();

    for (index, step) in manifest.install_steps().iter().enumerate() {
        let rel = Path::new(&step.source);
        let staged = canonical_within(&canonical_root, &root.join(rel), index, &step.source)?;
        let dest_dir = layout.destination_dir(step.destination);
        let name = step.rename.as_deref().map(OsStr::new).or_else(|| rel.file_name());

        if staged.is_dir() {
            let base = name.map_or_else(|| dest_dir.clone(), |n| dest_dir.join(n));
            let prefix = step.source.trim_end_matches('/');
            for (sub, file) in walk_files(&staged)? {
                let file = canonical_within(&canonical_root, &file, index, &step.source)?;
                files.push(ResolvedFile {
                    step: index,
                    source: format!("{prefix}/{}", sub.to_string_lossy()),
                    mode: publish_mode(&file, step.destination)?,
                    staged: file,
                    destination: step.destination,
                    target: base.join(&sub),
                });
            }
        } else {
            let name = name.ok_or_else(|| CoreError::SourceMissing {
                index,
                path: step.source.clone(),
            })?;
            files.push(ResolvedFile {
                step: index,
                source: step.source.clone(),
                mode: publish_mode(&staged, step.destination)?,
                staged,
                destination: step.destination,
                target: dest_dir.join(name),
            });
        }
    }

    let mut claimed: HashMap<&Path, usize> = HashMap::new();
    for file in &files {
        if let Some(first) = claimed.insert(file.target.as_path(), file.step) {
            return Err(CoreError::DuplicateDestination {
                target: file.target.clone(),
                first,
                second: file.step,
            });
        }
    }
    Ok(files)
}

fn canonical_within(
    canonical_root: &Path,
    path: &Path,
    index: usize,
    source: &str,
) -> Result<PathBuf, CoreError> {
    let canonical = match path.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CoreError::SourceMissing {
                index,
                path: source.to_owned(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    if canonical.starts_with(canonical_root) {
        Ok(canonical)
    } else {
        Err(CoreError::SourceEscapes {
            index,
            path: source.to_owned(),
        })
    }
}

/// Regular files (and symlinks to them) below `dir`, sorted, with relative paths.
fn walk_files(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>, CoreError> {
    let mut out = Vec::new();
    walk_into(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, PathBuf)>) -> Result<(), CoreError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = fs::metadata(&path)?;
        if meta.is_dir() {
            walk_into(root, &path, out)?;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| CoreError::Io(io::Error::other(format!("path strip: {e}"))))?
                .to_path_buf();
            out.push((rel, path));
        }
    }
    Ok(())
}

fn publish_mode(staged: &Path, destination: Destination) -> Result<u32, CoreError> {
    #[cfg(unix)]
    let base = {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(staged)?.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let base = {
        let _ = staged;
        0o644
    };
    Ok(if destination.is_executable() {
        base | 0o111
    } else {
        base
    })
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

fn backup_path(target: &Path, op_id: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.pallet-backup-{op_id}"))
}
