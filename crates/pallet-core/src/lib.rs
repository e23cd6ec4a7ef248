//! Install pipeline for Pallet manifests.
//!
//! This crate ties together manifest parsing, archive fetching, integrity
//! verification and the on-disk store into the `Engine`, which runs the
//! fail-closed pipeline parse, fetch, verify, install, smoke-test. It also
//! provides the `InstallExecutor` that publishes files under journaled
//! rollback, the `SmokeTestRunner`, per-destination locking and cancellation.

pub mod concurrency;
pub mod engine;
pub mod executor;
pub mod runner;

pub use concurrency::{
    install_signal_handler, shutdown_requested, CancellationToken, DestinationLock,
    DestinationLocks,
};
pub use engine::{Engine, InstallOptions, InstallOutcome};
pub use executor::{InstallExecutor, Published, ResolvedFile};
pub use runner::{SmokeTestRunner, TestFailure, TestReport, DEFAULT_TEST_TIMEOUT};

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage an error belongs to. Later stages never run after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Fetch,
    Verify,
    Install,
    Test,
    Cancelled,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Parse => write!(f, "parse"),
            Stage::Fetch => write!(f, "fetch"),
            Stage::Verify => write!(f, "verify"),
            Stage::Install => write!(f, "install"),
            Stage::Test => write!(f, "test"),
            Stage::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] pallet_schema::ManifestError),
    #[error("fetch error: {0}")]
    Fetch(#[from] pallet_fetch::FetchError),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("store error: {0}")]
    Store(#[from] pallet_store::StoreError),
    #[error("install step {index}: '{path}' not found in archive")]
    SourceMissing { index: usize, path: String },
    #[error("install step {index}: '{path}' resolves outside the archive")]
    SourceEscapes { index: usize, path: String },
    #[error("install steps {first} and {second} both install {}", .target.display())]
    DuplicateDestination {
        target: PathBuf,
        first: usize,
        second: usize,
    },
    #[error("cannot replace directory {} with a file", .0.display())]
    DestinationIsDirectory(PathBuf),
    #[error("package '{0}' is not installed")]
    NotInstalled(String),
    #[error("smoke test {index} failed: {command}")]
    TestFailed { index: usize, command: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn stage(&self) -> Stage {
        match self {
            CoreError::Manifest(_) => Stage::Parse,
            CoreError::Fetch(pallet_fetch::FetchError::Cancelled) | CoreError::Cancelled => {
                Stage::Cancelled
            }
            CoreError::Fetch(_) => Stage::Fetch,
            CoreError::ChecksumMismatch { .. } => Stage::Verify,
            CoreError::TestFailed { .. } => Stage::Test,
            CoreError::Store(_)
            | CoreError::SourceMissing { .. }
            | CoreError::SourceEscapes { .. }
            | CoreError::DuplicateDestination { .. }
            | CoreError::DestinationIsDirectory(_)
            | CoreError::NotInstalled(_)
            | CoreError::Io(_) => Stage::Install,
        }
    }

    /// Lift a store verification failure into the verify stage.
    pub(crate) fn from_verify(e: pallet_store::StoreError) -> Self {
        match e {
            pallet_store::StoreError::ChecksumMismatch { expected, actual } => {
                CoreError::ChecksumMismatch { expected, actual }
            }
            other => CoreError::Store(other),
        }
    }
}
