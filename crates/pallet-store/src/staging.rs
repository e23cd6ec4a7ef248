use crate::layout::InstallLayout;
use crate::StoreError;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tracing::{debug, warn};

const STAGING_PREFIX: &str = "stage-";

/// Scoped staging directory for one install run.
///
/// The directory lives under the layout's staging area and is removed when
/// the value is dropped, whether the run succeeded, failed, or unwound.
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn acquire(layout: &InstallLayout) -> Result<Self, StoreError> {
        let base = layout.staging_dir();
        fs::create_dir_all(&base)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&base)?;
        debug!("staging directory {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory now, surfacing any error instead of ignoring it.
    pub fn close(self) -> Result<(), StoreError> {
        self.dir.close()?;
        Ok(())
    }
}

/// Remove staging directories older than `max_age` left behind by killed runs.
///
/// Returns the number of directories removed. Younger directories may belong
/// to a concurrent run and are left alone.
pub fn clean_stale_staging(layout: &InstallLayout, max_age: Duration) -> Result<usize, StoreError> {
    let base = layout.staging_dir();
    if !base.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(&base)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(STAGING_PREFIX) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| now.duration_since(t).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("failed to remove stale staging dir {}: {e}", entry.path().display()),
        }
    }
    Ok(removed)
}
