use crate::concurrency::{CancellationToken, DestinationLock, DestinationLocks};
use crate::executor::{InstallExecutor, Published};
use crate::runner::{SmokeTestRunner, TestReport, DEFAULT_TEST_TIMEOUT};
use crate::CoreError;
use pallet_fetch::{ArchiveOrigin, FetchConfig, FetchedArchive, Fetcher};
use pallet_schema::{parse_manifest_file, Manifest};
use pallet_store::{
    clean_stale_staging, verify_bytes, DownloadCache, InstallLayout, InstallReceipt,
    InstalledArtifact, PublishJournal, ReceiptStore, RollbackStep, StoreError,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Staging directories older than this are assumed abandoned by a killed run.
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    pub skip_tests: bool,
    pub test_timeout: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            skip_tests: false,
            test_timeout: DEFAULT_TEST_TIMEOUT,
        }
    }
}

/// Result of a completed install.
///
/// Smoke-test failures do not undo the install: the artifacts stay in place
/// and `tests` carries the failure.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub receipt: InstallReceipt,
    pub origin: ArchiveOrigin,
    /// `None` when tests were skipped.
    pub tests: Option<TestReport>,
}

impl InstallOutcome {
    pub fn artifacts(&self) -> &[InstalledArtifact] {
        &self.receipt.artifacts
    }

    pub fn tests_passed(&self) -> bool {
        !matches!(&self.tests, Some(report) if !report.success())
    }
}

/// Pipeline engine: parse, fetch, verify, install, smoke-test.
///
/// Each stage runs only if the previous one succeeded. Construction
/// initializes the cache and state directories and rolls back any publish
/// left incomplete by a crashed run.
pub struct Engine {
    layout: InstallLayout,
    fetcher: Fetcher,
    cache: DownloadCache,
    receipts: ReceiptStore,
    journal: PublishJournal,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(layout: InstallLayout, fetch_config: FetchConfig) -> Result<Self, CoreError> {
        layout.initialize()?;
        layout.verify_version()?;

        let journal = PublishJournal::new(&layout);
        match journal.recover() {
            Ok(0) => {}
            Ok(n) => info!("rolled back {n} interrupted installs"),
            Err(e) => warn!("journal recovery failed: {e}"),
        }
        match clean_stale_staging(&layout, STALE_STAGING_AGE) {
            Ok(0) => {}
            Ok(n) => debug!("removed {n} stale staging directories"),
            Err(e) => warn!("stale staging cleanup failed: {e}"),
        }

        let cancel = CancellationToken::new();
        Ok(Self {
            fetcher: cancellable_fetcher(fetch_config, &cancel),
            cache: DownloadCache::new(layout.clone()),
            receipts: ReceiptStore::new(layout.clone()),
            journal,
            layout,
            cancel,
        })
    }

    /// Share `token` with the engine; cancelling it aborts the current stage.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        let config = self.fetcher.config().clone();
        self.fetcher = cancellable_fetcher(config, &token);
        self.cancel = token;
        self
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn load_manifest(&self, path: &Path) -> Result<Manifest, CoreError> {
        debug!("parsing {}", path.display());
        Ok(parse_manifest_file(path)?)
    }

    /// Archive bytes for `manifest`, verified against its checksum.
    ///
    /// A cached copy is used when it still verifies; otherwise the archive is
    /// fetched, verified, and cached. Bytes that fail verification are never
    /// cached or returned.
    pub fn fetch_verified(&self, manifest: &Manifest) -> Result<FetchedArchive, CoreError> {
        let checksum = manifest.checksum();
        match self.cache.get(checksum) {
            Ok(Some(bytes)) => {
                info!("{}: using cached archive {}", manifest.name(), checksum.short());
                return Ok(FetchedArchive {
                    url: manifest.url().to_owned(),
                    bytes,
                    origin: ArchiveOrigin::Cache,
                    attempts: 0,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("download cache unreadable, fetching: {e}"),
        }

        self.cancel.check()?;
        let archive = self.fetcher.fetch(manifest.url())?;
        verify_bytes(&archive.bytes, checksum).map_err(CoreError::from_verify)?;
        info!("{}: verified {}", manifest.name(), checksum.short());

        if let Err(e) = self.cache.put(checksum, archive.file_name(), &archive.bytes) {
            warn!("could not cache archive: {e}");
        }
        Ok(archive)
    }

    pub fn install_file(
        &self,
        manifest_path: &Path,
        options: InstallOptions,
    ) -> Result<InstallOutcome, CoreError> {
        let manifest = self.load_manifest(manifest_path)?;
        self.install(&manifest, options)
    }

    pub fn install(
        &self,
        manifest: &Manifest,
        options: InstallOptions,
    ) -> Result<InstallOutcome, CoreError> {
        info!("installing {} {}", manifest.name(), manifest.version());
        let archive = self.fetch_verified(manifest)?;
        self.cancel.check()?;

        let receipt_path = self.receipts.path(manifest.name())?;
        let _receipt_lock = self.lock_receipt(&receipt_path)?;
        let previous = match self.receipts.get(manifest.name()) {
            Ok(r) => Some(r),
            Err(StoreError::ReceiptNotFound(_)) => None,
            Err(e) => {
                warn!("ignoring unreadable receipt for {}: {e}", manifest.name());
                None
            }
        };

        let executor = InstallExecutor::new(&self.layout, &self.journal, &self.cancel);
        let published = executor.install(manifest, &archive)?;

        let receipt = InstallReceipt {
            name: manifest.name().clone(),
            version: manifest.version().clone(),
            archive_checksum: manifest.checksum().clone(),
            url: manifest.url().to_owned(),
            installed_at: chrono::Utc::now().to_rfc3339(),
            artifacts: published.artifacts().to_vec(),
            checksum: None,
        };
        self.write_receipt(&published, &receipt_path, &receipt)?;
        published.commit()?;
        if let Some(previous) = previous {
            self.remove_superseded(&previous, &receipt);
        }

        let tests = if options.skip_tests {
            info!("{}: smoke tests skipped", manifest.name());
            None
        } else {
            Some(self.runner(options.test_timeout).run(manifest))
        };

        Ok(InstallOutcome {
            receipt,
            origin: archive.origin,
            tests,
        })
    }

    /// Run smoke tests for an installed manifest.
    pub fn test(&self, manifest: &Manifest, timeout: Duration) -> Result<TestReport, CoreError> {
        if !self.receipts.exists(manifest.name()) {
            return Err(CoreError::NotInstalled(manifest.name().to_string()));
        }
        Ok(self.runner(timeout).run(manifest))
    }

    /// Remove every file recorded for `name`, then its receipt.
    ///
    /// Returns the paths removed. Files already gone are skipped; directories
    /// left empty are pruned up to the prefix.
    pub fn uninstall(&self, name: &str) -> Result<Vec<PathBuf>, CoreError> {
        let receipt_path = self.receipts.path(name).map_err(not_installed)?;
        let _receipt_lock = self.lock_receipt(&receipt_path)?;
        let receipt = self.receipt(name)?;
        info!("uninstalling {} {}", receipt.name, receipt.version);

        let _locks = DestinationLocks::acquire(
            &self.layout.locks_dir(),
            receipt.artifacts.iter().map(|a| a.path.as_path()),
        )?;

        let mut removed = Vec::new();
        for artifact in &receipt.artifacts {
            match fs::remove_file(&artifact.path) {
                Ok(()) => {
                    debug!("removed {}", artifact.path.display());
                    removed.push(artifact.path.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("already gone: {}", artifact.path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        for path in &removed {
            self.prune_empty_dirs(path);
        }
        self.receipts.remove(name)?;
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<InstallReceipt>, CoreError> {
        Ok(self.receipts.list()?)
    }

    pub fn receipt(&self, name: &str) -> Result<InstallReceipt, CoreError> {
        self.receipts.get(name).map_err(not_installed)
    }

    /// Serializes installs and uninstalls of one package. Taken before any
    /// destination lock.
    fn lock_receipt(&self, receipt_path: &Path) -> Result<DestinationLock, CoreError> {
        DestinationLock::acquire(&DestinationLock::path_for(
            &self.layout.locks_dir(),
            receipt_path,
        ))
    }

    /// Write `receipt` under `published`'s journal entry, so a failed write
    /// (or a crash before commit) also takes the published files back out.
    fn write_receipt(
        &self,
        published: &Published<'_>,
        path: &Path,
        receipt: &InstallReceipt,
    ) -> Result<(), CoreError> {
        if path.is_file() {
            let backup = path.with_file_name(format!(
                ".{}.json.pallet-backup-{}",
                receipt.name,
                published.op_id()
            ));
            published.record(RollbackStep::RestoreBackup {
                backup: backup.clone(),
                original: path.to_path_buf(),
            })?;
            fs::rename(path, &backup)?;
        }
        published.record(RollbackStep::RemoveFile(path.to_path_buf()))?;
        self.receipts.put(receipt)?;
        Ok(())
    }

    fn runner(&self, timeout: Duration) -> SmokeTestRunner {
        SmokeTestRunner::new(&self.layout)
            .with_timeout(timeout)
            .with_cancellation(self.cancel.clone())
    }

    /// Delete files the previous install owned that the new one no longer ships.
    fn remove_superseded(&self, previous: &InstallReceipt, current: &InstallReceipt) {
        let kept: HashSet<&Path> = current.artifacts.iter().map(|a| a.path.as_path()).collect();
        let stale: Vec<&Path> = previous
            .artifacts
            .iter()
            .map(|a| a.path.as_path())
            .filter(|p| !kept.contains(p))
            .collect();
        if stale.is_empty() {
            return;
        }
        let _locks = match DestinationLocks::acquire(&self.layout.locks_dir(), stale.iter().copied())
        {
            Ok(l) => l,
            Err(e) => {
                warn!("could not lock superseded files: {e}");
                return;
            }
        };
        for path in stale {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!("removed superseded {}", path.display());
                    self.prune_empty_dirs(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove superseded {}: {e}", path.display()),
            }
        }
    }

    fn prune_empty_dirs(&self, removed_file: &Path) {
        let prefix = self.layout.prefix();
        let mut dir = removed_file.parent();
        while let Some(d) = dir {
            if d == prefix || !d.starts_with(prefix) || fs::remove_dir(d).is_err() {
                break;
            }
            debug!("removed empty directory {}", d.display());
            dir = d.parent();
        }
    }
}

fn not_installed(e: StoreError) -> CoreError {
    match e {
        StoreError::ReceiptNotFound(n) => CoreError::NotInstalled(n),
        other => CoreError::Store(other),
    }
}

fn cancellable_fetcher(config: FetchConfig, token: &CancellationToken) -> Fetcher {
    let token = token.clone();
    Fetcher::new(config).with_cancel_check(move || token.is_cancelled())
}
