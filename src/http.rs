//! HTTP executors for the request coordinator
//!
//! Wraps `reqwest` GET requests so their results can be cached. A non-success
//! status is reported as [`CacheError::RequestFailed`]; a body that does not
//! decode is reported as [`CacheError::ResponseParseError`].

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::error::CacheError;

/// Client for fetching JSON resources
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    /// Create a new HttpFetcher with default settings
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Create a new HttpFetcher with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Fetch `url` and decode its body as JSON
    ///
    /// # Returns
    /// * `Ok(T)` - The decoded body
    /// * `Err(CacheError::RequestFailed)` - Transport failure or non-success status
    /// * `Err(CacheError::ResponseParseError)` - The body is not valid JSON for `T`
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CacheError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::RequestFailed(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Returns an executor that fetches `url` when invoked
    pub fn executor<T>(
        &self,
        url: impl Into<String>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<T, CacheError>> + Send + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let fetcher = self.clone();
        let url = url.into();
        move || async move { fetcher.fetch_json(&url).await }.boxed()
    }
}
