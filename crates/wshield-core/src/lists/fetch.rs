//! Download collaborators for list and feed sources

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
#[cfg(feature = "http")]
use std::time::Duration;

/// Fetches the raw text of a list source
///
/// Parsing is done by the caller, implementations only move bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListFetcher: Send + Sync {
    /// Fetch the full document at `location`
    async fn fetch(&self, location: &str) -> Result<String>;
}

/// Reads sources from the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FileFetcher;

impl FileFetcher {
    /// Creates a new file fetcher
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ListFetcher for FileFetcher {
    async fn fetch(&self, location: &str) -> Result<String> {
        let path = location.strip_prefix("file://").unwrap_or(location);
        tokio::fs::read_to_string(Path::new(path))
            .await
            .map_err(|e| Error::fetch(location, e.to_string()))
    }
}

/// Downloads sources over HTTP(S)
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    /// Creates a fetcher with a 30 second request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("webshield/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::fetch("http", e.to_string()))?;
        Ok(Self { client })
    }

    /// Creates a fetcher with a custom client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl ListFetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<String> {
        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|e| Error::fetch(location, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::fetch(
                location,
                format!("HTTP {}", response.status()),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| Error::fetch(location, e.to_string()))
    }
}

/// Dispatches to the HTTP or file fetcher by location scheme
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    #[cfg(feature = "http")]
    http: HttpFetcher,
    file: FileFetcher,
}

impl SourceFetcher {
    /// Creates the default fetcher stack
    pub fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(feature = "http")]
            http: HttpFetcher::new()?,
            file: FileFetcher::new(),
        })
    }
}

fn is_remote(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[async_trait]
impl ListFetcher for SourceFetcher {
    async fn fetch(&self, location: &str) -> Result<String> {
        if is_remote(location) {
            #[cfg(feature = "http")]
            return self.http.fetch(location).await;

            #[cfg(not(feature = "http"))]
            return Err(Error::fetch(
                location,
                "built without the `http` feature",
            ));
        }
        self.file.fetch(location).await
    }
}
