use crate::{map_read_error, read_bounded, ArchiveSource, FetchError};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads archives from `file://` URLs and absolute paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSource;

impl LocalSource {
    /// Filesystem path a local URL refers to, or `None` for network URLs.
    pub fn path_of(url: &str) -> Option<PathBuf> {
        if let Some(rest) = url.strip_prefix("file://") {
            return Some(PathBuf::from(rest));
        }
        let path = Path::new(url);
        path.is_absolute().then(|| path.to_path_buf())
    }
}

impl ArchiveSource for LocalSource {
    fn fetch_once(&self, url: &str, limit: u64) -> Result<Vec<u8>, FetchError> {
        let path = Self::path_of(url).ok_or_else(|| FetchError::UnsupportedScheme(url.to_owned()))?;
        debug!("reading {}", path.display());
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FetchError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(FetchError::Io(e)),
        };
        if file.metadata()?.len() > limit {
            return Err(FetchError::TooLarge {
                url: url.to_owned(),
                limit,
            });
        }
        read_bounded(file, url, limit).map_err(|e| map_read_error(e, false))
    }
}
