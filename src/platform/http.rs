//! HTTP Image Fetcher
//!
//! Streams source images to disk with `reqwest`. The whole transfer is
//! bounded by the caller's timeout; a failed or timed-out transfer removes
//! whatever was written.

use crate::domain::ByteFetcher;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Configuration for the HTTP fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Bound on connection establishment
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
        }
    }
}

/// [`ByteFetcher`] over HTTP(S) and the local filesystem
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn stream_to(&self, url: &str, dest: &Path) -> Result<u64> {
        let fetch_err = |reason: String| Error::Fetch {
            source_ref: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP status {}", status)));
        }
        let expected = response.content_length();

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_err(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            if expected != written {
                return Err(fetch_err(format!(
                    "truncated transfer: {} of {} bytes",
                    written, expected
                )));
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64> {
        debug!("Downloading {} to {}", url, dest.display());

        let result = match tokio::time::timeout(timeout, self.stream_to(url, dest)).await {
            Ok(result) => result,
            Err(_) => Err(Error::FetchTimeout {
                source_ref: url.to_string(),
                secs: timeout.as_secs(),
            }),
        };

        match result {
            Ok(bytes) => {
                info!(url, bytes, "Download complete");
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    async fn fetch_local(&self, source: &Path, dest: &Path) -> Result<u64> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::SourceNotFound {
                path: source.display().to_string(),
            });
        }
        let bytes = tokio::fs::copy(source, dest).await.map_err(|e| Error::Fetch {
            source_ref: source.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes)
    }
}
