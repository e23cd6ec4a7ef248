use crate::integrity::verify_bytes;
use crate::layout::InstallLayout;
use crate::{fsync_dir, StoreError};
use pallet_schema::Checksum;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Checksum-keyed cache of verified downloads.
///
/// Entries are named `<algo>-<hex>--<file name>` so that the same archive
/// fetched from two URLs is stored once. Reads re-verify the digest; an entry
/// that no longer matches is deleted and reported as a miss.
pub struct DownloadCache {
    layout: InstallLayout,
}

impl DownloadCache {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }

    fn key_prefix(checksum: &Checksum) -> String {
        format!("{}-{}--", checksum.algorithm(), checksum.hex())
    }

    pub fn entry_path(&self, checksum: &Checksum, file_name: &str) -> PathBuf {
        let name = file_name.rsplit('/').next().unwrap_or("");
        let name = if name.is_empty() { "download" } else { name };
        self.layout
            .downloads_dir()
            .join(format!("{}{name}", Self::key_prefix(checksum)))
    }

    fn find(&self, checksum: &Checksum) -> Result<Option<PathBuf>, StoreError> {
        let dir = self.layout.downloads_dir();
        if !dir.exists() {
            return Ok(None);
        }
        let prefix = Self::key_prefix(checksum);
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Cached bytes for `checksum`, verified on read.
    pub fn get(&self, checksum: &Checksum) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(path) = self.find(checksum)? else {
            return Ok(None);
        };
        let data = fs::read(&path)?;
        match verify_bytes(&data, checksum) {
            Ok(()) => {
                debug!("cache hit: {}", path.display());
                Ok(Some(data))
            }
            Err(StoreError::ChecksumMismatch { actual, .. }) => {
                warn!(
                    "discarding corrupt cache entry {} (digest {actual})",
                    path.display()
                );
                fs::remove_file(&path)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Store verified bytes. Idempotent: an existing entry is kept.
    pub fn put(
        &self,
        checksum: &Checksum,
        file_name: &str,
        data: &[u8],
    ) -> Result<PathBuf, StoreError> {
        verify_bytes(data, checksum)?;
        if let Some(existing) = self.find(checksum)? {
            return Ok(existing);
        }

        let dir = self.layout.downloads_dir();
        fs::create_dir_all(&dir)?;
        let dest = self.entry_path(checksum, file_name);
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        debug!("cached {} bytes at {}", data.len(), dest.display());
        Ok(dest)
    }
}
