use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Exclusive advisory lock on one lock file.
pub struct DestinationLock {
    lock_file: File,
}

impl DestinationLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    /// Lock file guarding `target`: `<locks_dir>/<blake3(target)>.lock`.
    pub fn path_for(locks_dir: &Path, target: &Path) -> PathBuf {
        let key = blake3::hash(target.as_os_str().as_encoded_bytes()).to_hex();
        locks_dir.join(format!("{key}.lock"))
    }
}

impl Drop for DestinationLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

/// Locks for a set of destination paths, held together.
///
/// Paths are sorted and deduplicated before locking so that two publishers
/// with overlapping destinations always acquire in the same order.
pub struct DestinationLocks {
    _locks: Vec<DestinationLock>,
}

impl DestinationLocks {
    pub fn acquire<'a, I>(locks_dir: &Path, targets: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = &'a Path>,
    {
        let mut paths: Vec<PathBuf> = targets
            .into_iter()
            .map(|t| DestinationLock::path_for(locks_dir, t))
            .collect();
        paths.sort();
        paths.dedup();
        debug!("acquiring {} destination locks", paths.len());
        let locks = paths
            .iter()
            .map(|p| DestinationLock::acquire(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { _locks: locks })
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ncancellation requested, rolling back current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Per-engine cancellation flag, also tripped by the process-wide signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || shutdown_requested()
    }

    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}
