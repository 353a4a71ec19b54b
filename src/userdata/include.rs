//! `#include` support: URL fetching and the `#include-once` cache

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

use crate::BootstrapError;
use crate::config::UserDataConfig;

/// Body and status of a fetched include
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Retrieves included URLs
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`
    ///
    /// A reachable server answering with an error status is an `Ok` response;
    /// errors mean nothing usable came back.
    async fn fetch(&self, url: &str) -> Result<FetchResponse, BootstrapError>;
}

/// Fetches over HTTP(S); `file://` URLs and absolute paths are read locally
pub struct HttpFetcher {
    client: Client,
    retries: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, BootstrapError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            retries: 0,
            retry_delay: Duration::ZERO,
        })
    }

    pub fn from_config(config: &UserDataConfig) -> Result<Self, BootstrapError> {
        Ok(Self::new(Duration::from_secs(config.include_timeout_secs))?.with_retries(
            config.include_retries,
            Duration::from_millis(config.include_retry_delay_ms),
        ))
    }

    /// Retry connection failures and server errors `retries` more times
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    async fn fetch_http(&self, url: &str) -> Result<FetchResponse, BootstrapError> {
        let mut attempt = 0;
        loop {
            let result = match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    response
                        .bytes()
                        .await
                        .map(|body| FetchResponse {
                            status,
                            body: body.to_vec(),
                        })
                        .map_err(BootstrapError::from)
                }
                Err(e) => Err(BootstrapError::from(e)),
            };

            let retryable = match &result {
                Ok(response) => response.status >= 500,
                Err(_) => true,
            };
            if !retryable || attempt >= self.retries {
                return result;
            }

            attempt += 1;
            debug!("Retrying {} ({}/{})", url, attempt, self.retries);
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, BootstrapError> {
        if let Some(path) = local_path(url) {
            debug!("Reading include from {}", path.display());
            return Ok(FetchResponse::ok(fs::read(path).await?));
        }
        self.fetch_http(url).await
    }
}

fn local_path(url: &str) -> Option<&Path> {
    url.strip_prefix("file://")
        .or_else(|| url.starts_with('/').then_some(url))
        .map(Path::new)
}

/// On-disk cache of `#include-once` content, keyed by URL hash
#[derive(Debug, Clone)]
pub struct IncludeCache {
    dir: PathBuf,
}

impl IncludeCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Hex SHA-256 of the URL
    pub fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(Self::key(url))
    }

    pub async fn get(&self, url: &str) -> Option<Vec<u8>> {
        fs::read(self.path_for(url)).await.ok()
    }

    /// Store content readable by the owner only
    pub async fn put(&self, url: &str, content: &[u8]) -> Result<(), BootstrapError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(url);
        fs::write(&path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        debug!("Cached {} as {}", url, path.display());
        Ok(())
    }

    /// Cached content, or fetch and cache it on a successful status
    ///
    /// Failures are logged and give empty content.
    pub async fn get_or_fetch(&self, url: &str, fetcher: &dyn Fetcher) -> Vec<u8> {
        if let Some(content) = self.get(url).await {
            debug!("Include cache hit for {}", url);
            return content;
        }

        let content = fetch_or_empty(url, fetcher).await;
        if let Some(content) = &content {
            if let Err(e) = self.put(url, content).await {
                warn!("Failed to cache {}: {}", url, e);
            }
        }
        content.unwrap_or_default()
    }
}

/// Body of a successful fetch; failures are logged
pub async fn fetch_or_empty(url: &str, fetcher: &dyn Fetcher) -> Option<Vec<u8>> {
    match fetcher.fetch(url).await {
        Ok(response) if response.is_success() => Some(response.body),
        Ok(response) => {
            warn!("Fetching {} returned status {}", url, response.status);
            None
        }
        Err(e) => {
            warn!("Failed to fetch {}: {}", url, e);
            None
        }
    }
}

/// URLs named by an include part, each with its once flag
///
/// `#include-once` turns once-mode on and `#include` turns it off, for the
/// URL on the same line and the lines after it.
pub fn include_urls(text: &str, once_by_default: bool) -> Vec<(String, bool)> {
    let mut once = once_by_default;
    let mut urls = Vec::new();

    for line in text.lines() {
        let mut line = line.trim();
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("#include-once") {
            line = line.get("#include-once".len()..).unwrap_or_default().trim();
            once = true;
        } else if lower.starts_with("#include") {
            line = line.get("#include".len()..).unwrap_or_default().trim();
            once = false;
        }

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        urls.push((line.to_string(), once));
    }

    urls
}
