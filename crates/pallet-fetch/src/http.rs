use crate::{map_read_error, read_bounded, ArchiveSource, FetchConfig, FetchError};
use tracing::debug;

/// Fetches archives over http and https.
pub struct HttpSource {
    agent: ureq::Agent,
    user_agent: String,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .build()
            .into();
        Self {
            agent,
            user_agent: config.user_agent.clone(),
        }
    }

    pub fn handles(url: &str) -> bool {
        url.starts_with("https://") || url.starts_with("http://")
    }
}

fn map_call_error(url: &str, e: ureq::Error) -> FetchError {
    match e {
        ureq::Error::StatusCode(404) => FetchError::NotFound(url.to_owned()),
        ureq::Error::StatusCode(code) => FetchError::Status {
            url: url.to_owned(),
            code,
        },
        ureq::Error::Timeout(_) => FetchError::Timeout(url.to_owned()),
        ureq::Error::Io(_) | ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => {
            FetchError::Network(format!("{url}: {e}"))
        }
        other => FetchError::Http(format!("{url}: {other}")),
    }
}

impl ArchiveSource for HttpSource {
    fn fetch_once(&self, url: &str, limit: u64) -> Result<Vec<u8>, FetchError> {
        debug!("GET {url}");
        let resp = self
            .agent
            .get(url)
            .header("User-Agent", &self.user_agent)
            .call()
            .map_err(|e| map_call_error(url, e))?;

        let declared = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(FetchError::TooLarge {
                url: url.to_owned(),
                limit,
            });
        }

        let reader = resp.into_body().into_reader();
        let body = read_bounded(reader, url, limit).map_err(|e| map_read_error(e, true))?;
        debug!("GET {url}: {} bytes", body.len());
        Ok(body)
    }
}
