//! Archive retrieval for Pallet.
//!
//! This crate fetches the bytes a manifest's `source.url` points at, over
//! http(s) via `ureq` or from the local filesystem, with bounded retry and
//! exponential backoff on transient failures and a hard cap on archive size.
//! It knows nothing about checksums: verification happens downstream.

pub mod config;
pub mod fetcher;
pub mod http;
pub mod local;

pub use config::FetchConfig;
pub use fetcher::{file_name_of, ArchiveOrigin, FetchedArchive, Fetcher};
pub use http::HttpSource;
pub use local::LocalSource;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("HTTP {code} for {url}")]
    Status { url: String, code: u16 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("archive at {url} exceeds the {limit}-byte limit")]
    TooLarge { url: String, limit: u64 },
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("fetch config error: {0}")]
    Config(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) => true,
            FetchError::Status { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Anything that can produce the bytes behind a URL in one attempt.
pub trait ArchiveSource: Send + Sync {
    /// Fetch `url`, failing with [`FetchError::TooLarge`] past `limit` bytes.
    fn fetch_once(&self, url: &str, limit: u64) -> Result<Vec<u8>, FetchError>;
}

/// Read at most `limit` bytes, failing if the reader holds more.
pub(crate) fn read_bounded<R: std::io::Read>(
    reader: R,
    url: &str,
    limit: u64,
) -> Result<Vec<u8>, std::io::Error> {
    use std::io::Read;
    let mut body = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Err(std::io::Error::other(TooLargeMarker {
            url: url.to_owned(),
            limit,
        }));
    }
    Ok(body)
}

/// Carried through `io::Error` so readers can report the size cap distinctly.
#[derive(Debug)]
pub(crate) struct TooLargeMarker {
    pub url: String,
    pub limit: u64,
}

impl std::fmt::Display for TooLargeMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} exceeds {} bytes", self.url, self.limit)
    }
}

impl std::error::Error for TooLargeMarker {}

/// Turn an `io::Error` from [`read_bounded`] back into a `FetchError`.
pub(crate) fn map_read_error(e: std::io::Error, transient: bool) -> FetchError {
    if let Some(marker) = e.get_ref().and_then(|inner| inner.downcast_ref::<TooLargeMarker>()) {
        return FetchError::TooLarge {
            url: marker.url.clone(),
            limit: marker.limit,
        };
    }
    if transient {
        FetchError::Network(e.to_string())
    } else {
        FetchError::Io(e)
    }
}
