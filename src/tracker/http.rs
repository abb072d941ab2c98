//! HTTP fetch collaborator

use anyhow::Result;
use async_trait::async_trait;

/// Fetches the body behind a URL
///
/// Any error is treated by the tracker engine as a connection failure.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

#[cfg(feature = "http")]
pub use self::reqwest_fetcher::ReqwestFetcher;

#[cfg(feature = "http")]
mod reqwest_fetcher {
    use std::time::Duration;

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use tracing::{debug, trace};

    use super::HttpFetcher;

    /// `reqwest` backed fetcher with a per-request timeout
    #[derive(Debug, Clone)]
    pub struct ReqwestFetcher {
        client: reqwest::Client,
    }

    impl ReqwestFetcher {
        pub fn new(timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .redirect(reqwest::redirect::Policy::limited(3))
                .build()
                .context("Failed to build HTTP client")?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl HttpFetcher for ReqwestFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            debug!("GET {}", url);
            let response = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("Request to {} failed", url))?
                .error_for_status()?;
            let body = response.bytes().await.context("Failed to read response body")?;
            trace!("Received {} bytes from {}", body.len(), url);
            Ok(body.to_vec())
        }
    }
}
