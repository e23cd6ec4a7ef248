//! On-disk state for Pallet: install layout, integrity, staging, cache, journal, receipts.
//!
//! This crate provides the storage layer: `InstallLayout` for the prefix, cache
//! and state directory structure, digest computation and checksum verification
//! (`verify_bytes`), archive extraction into scoped `Staging` directories, the
//! checksum-keyed `DownloadCache`, the `PublishJournal` used to roll back
//! partially published installs, and the `ReceiptStore` recording what each
//! installed package owns.

pub mod archive;
pub mod cache;
pub mod integrity;
pub mod journal;
pub mod layout;
pub mod receipts;
pub mod staging;

pub use archive::{
    extract_archive, extract_archive_within, source_root, ArchiveKind, MAX_UNPACKED_BYTES,
};
pub use cache::DownloadCache;
pub use integrity::{digest_bytes, verify_bytes, StreamingDigest};
pub use journal::{JournalEntry, JournalOp, PublishJournal, RollbackStep};
pub use layout::{InstallLayout, STATE_FORMAT_VERSION};
pub use receipts::{InstallReceipt, InstalledArtifact, ReceiptStore};
pub use staging::{clean_stale_staging, Staging};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee rename durability without syncing the parent
/// directory, so every atomic write in this crate ends with this call.
pub fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("integrity check failed for '{what}': expected {expected}, got {actual}")]
    IntegrityFailure {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("archive extraction failed: {0}")]
    Archive(String),
    #[error("no receipt for package '{0}'")]
    ReceiptNotFound(String),
    #[error("journal entry not found: {0}")]
    JournalEntryNotFound(String),
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
