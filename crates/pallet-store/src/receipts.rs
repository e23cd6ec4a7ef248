use crate::layout::InstallLayout;
use crate::{fsync_dir, StoreError};
use pallet_schema::{validate_package_name, Checksum, Destination, PackageName, Version};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// One file placed into the prefix by an install step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledArtifact {
    /// Zero-based index of the install step that placed the file.
    pub step: usize,
    /// Path relative to the archive's source root.
    pub source: String,
    pub destination: Destination,
    /// Absolute path of the published file.
    pub path: PathBuf,
    pub mode: u32,
}

/// Record of a completed install, kept under the state directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallReceipt {
    pub name: PackageName,
    pub version: Version,
    pub archive_checksum: Checksum,
    pub url: String,
    pub installed_at: String,
    pub artifacts: Vec<InstalledArtifact>,
    /// blake3 checksum for integrity verification. `None` for legacy receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl InstallReceipt {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

pub struct ReceiptStore {
    layout: InstallLayout,
}

impl ReceiptStore {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }

    /// Receipt file for `name`. A name that is not a valid package name has
    /// no receipt, so it can never address a file outside the receipts directory.
    pub fn path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_package_name(name).map_err(|_| StoreError::ReceiptNotFound(name.to_owned()))?;
        Ok(self.layout.receipts_dir().join(format!("{name}.json")))
    }

    pub fn put(&self, receipt: &InstallReceipt) -> Result<(), StoreError> {
        let dest = self.path(&receipt.name)?;
        let dir = self.layout.receipts_dir();
        fs::create_dir_all(&dir)?;

        let mut sealed = receipt.clone();
        sealed.checksum = Some(sealed.compute_checksum()?);
        let content = serde_json::to_string_pretty(&sealed)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<InstallReceipt, StoreError> {
        let path = self.path(name)?;
        if !path.exists() {
            return Err(StoreError::ReceiptNotFound(name.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let receipt: InstallReceipt = serde_json::from_str(&content)?;

        if let Some(ref expected) = receipt.checksum {
            let actual = receipt.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    what: format!("receipt {name}"),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(receipt)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_ok_and(|p| p.exists())
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path(name)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All readable receipts sorted by name. Corrupt receipts are skipped with a warning.
    pub fn list(&self) -> Result<Vec<InstallReceipt>, StoreError> {
        let dir = self.layout.receipts_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() || !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(name) {
                Ok(receipt) => results.push(receipt),
                Err(e) => tracing::warn!("skipping corrupted receipt '{name}': {e}"),
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }
}
