use crate::StoreError;
use pallet_schema::Destination;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current state directory format version. Incremented on incompatible changes.
pub const STATE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for an install prefix and Pallet's own bookkeeping.
///
/// The prefix is the destination root that installs publish into. The cache
/// holds downloaded archives and staging directories; the state directory
/// holds locks, the publish journal, and receipts. Only the cache and state
/// directories are created by [`initialize`](Self::initialize); the prefix is
/// left untouched until something is actually published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    prefix: PathBuf,
    cache_dir: PathBuf,
    state_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateVersion {
    format_version: u32,
}

impl InstallLayout {
    pub fn new(
        prefix: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            cache_dir: cache_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Layout with cache and state kept under `<root>/cache` and `<root>/state`.
    pub fn with_root(prefix: impl Into<PathBuf>, root: &Path) -> Self {
        Self::new(prefix, root.join("cache"), root.join("state"))
    }

    #[inline]
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    #[inline]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    #[inline]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    #[inline]
    pub fn destination_dir(&self, destination: Destination) -> PathBuf {
        let mut dir = self.prefix.clone();
        for part in destination.relative_dir().split('/') {
            dir.push(part);
        }
        dir
    }

    /// Directories prepended to `PATH` when running smoke tests.
    pub fn executable_dirs(&self) -> Vec<PathBuf> {
        Destination::ALL
            .into_iter()
            .filter(|d| d.is_executable())
            .map(|d| self.destination_dir(d))
            .collect()
    }

    #[inline]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    /// Scratch area for extracting archives before publishing.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir.join("staging")
    }

    #[inline]
    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir.join("journal")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    #[inline]
    pub fn receipts_dir(&self) -> PathBuf {
        self.state_dir.join("receipts")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.downloads_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.journal_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.receipts_dir())?;

        let version_path = self.state_dir.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StateVersion {
                format_version: STATE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.state_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.state_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.state_dir.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StateVersion = serde_json::from_str(&content)?;

        if ver.format_version != STATE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
