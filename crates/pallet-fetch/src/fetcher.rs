use crate::{ArchiveSource, FetchConfig, FetchError, HttpSource, LocalSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Longest uninterrupted sleep while backing off; cancellation is polled between slices.
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

/// Where the bytes of a [`FetchedArchive`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOrigin {
    Network,
    LocalFile,
    Cache,
}

impl std::fmt::Display for ArchiveOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveOrigin::Network => write!(f, "network"),
            ArchiveOrigin::LocalFile => write!(f, "local file"),
            ArchiveOrigin::Cache => write!(f, "cache"),
        }
    }
}

/// Raw archive bytes for one pipeline run.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub url: String,
    pub bytes: Vec<u8>,
    pub origin: ArchiveOrigin,
    /// Attempts made; zero for cache hits.
    pub attempts: u32,
}

impl FetchedArchive {
    /// Last path segment of the URL, without query or fragment.
    pub fn file_name(&self) -> &str {
        file_name_of(&self.url)
    }
}

pub fn file_name_of(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end]
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
}

type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Scheme dispatch plus the retry loop.
pub struct Fetcher {
    config: FetchConfig,
    http: Box<dyn ArchiveSource>,
    local: Box<dyn ArchiveSource>,
    cancelled: CancelCheck,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Self {
        let http = Box::new(HttpSource::new(&config));
        Self {
            config,
            http,
            local: Box::new(LocalSource),
            cancelled: Arc::new(|| false),
        }
    }

    /// Replace the network source, e.g. with a scripted one in tests.
    #[must_use]
    pub fn with_http_source(mut self, source: Box<dyn ArchiveSource>) -> Self {
        self.http = source;
        self
    }

    /// Consult `check` before every attempt and after every backoff.
    #[must_use]
    pub fn with_cancel_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.cancelled = Arc::new(check);
        self
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn fetch(&self, url: &str) -> Result<FetchedArchive, FetchError> {
        let (source, origin) = if HttpSource::handles(url) {
            (self.http.as_ref(), ArchiveOrigin::Network)
        } else if LocalSource::path_of(url).is_some() {
            (self.local.as_ref(), ArchiveOrigin::LocalFile)
        } else {
            return Err(FetchError::UnsupportedScheme(url.to_owned()));
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if (self.cancelled)() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;
            debug!("fetch {url}: attempt {attempt}/{max_attempts}");
            match source.fetch_once(url, self.config.max_archive_bytes) {
                Ok(bytes) => {
                    info!("fetched {url} ({} bytes, {attempt} attempt(s))", bytes.len());
                    return Ok(FetchedArchive {
                        url: url.to_owned(),
                        bytes,
                        origin,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    warn!("fetch {url} failed ({e}); retrying in {delay:?}");
                    self.back_off(delay)?;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("fetch {url} failed after {attempt} attempts: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn back_off(&self, delay: Duration) -> Result<(), FetchError> {
        let deadline = Instant::now() + delay;
        loop {
            if (self.cancelled)() {
                return Err(FetchError::Cancelled);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(BACKOFF_SLICE));
        }
    }
}
