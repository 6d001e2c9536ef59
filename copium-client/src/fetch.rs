//! Outbound network requests
//!
//! Every request the client issues is described by a [`ResourceRequest`] and
//! executed through a [`Fetch`] implementation, normally [`HttpFetcher`].

use crate::error::FetchError;
use crate::progress::{DownloadProgress, ProgressSender};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Upper bound on the body buffer reserved from `Content-Length`
const MAX_PREALLOCATE: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// How the request was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load; may be answered with the cached shell offline
    Navigate,
    #[default]
    Subresource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Never served from or written to a store
    NoStore,
}

/// An outbound request
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub cache_mode: CacheMode,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub timeout: Option<Duration>,
}

impl ResourceRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            mode: RequestMode::Subresource,
            cache_mode: CacheMode::Default,
            body: None,
            content_type: None,
            timeout: None,
        }
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// POST with a JSON body; never cached
    pub fn post_json<T: Serialize>(url: Url, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::Post,
            body: Some(serde_json::to_vec(body)?),
            content_type: Some("application/json".to_string()),
            cache_mode: CacheMode::NoStore,
            ..Self::get(url)
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_store(mut self) -> Self {
        self.cache_mode = CacheMode::NoStore;
        self
    }

    /// Key under which the response is stored
    pub fn cache_key(&self) -> String {
        self.url.as_str().to_string()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// A response body fully read into memory
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes requests against the network
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Perform the request, reporting body progress when a sender is given
    async fn fetch(
        &self,
        request: &ResourceRequest,
        progress: Option<&ProgressSender>,
    ) -> Result<FetchedResponse, FetchError>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
    http_client: Client,
    default_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(default_timeout: Duration) -> Result<Self, FetchError> {
        let http_client = Client::builder().build()?;
        Ok(Self {
            http_client,
            default_timeout,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        request: &ResourceRequest,
        progress: Option<&ProgressSender>,
    ) -> Result<FetchedResponse, FetchError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let url = request.url.clone();

        let mut builder = match request.method {
            Method::Get => self.http_client.get(url),
            Method::Post => self.http_client.post(url),
        }
        .timeout(timeout);

        if let Some(ref content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| map_error(e, timeout))?;
        let status = response.status().as_u16();
        let total = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let file = request.cache_key();
        let mut body = Vec::with_capacity(total.map_or(0, |t| t.min(MAX_PREALLOCATE)) as usize);
        let mut chunks = response.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            if progress.is_some_and(|p| p.is_cancelled()) {
                debug!(url = %file, "Download cancelled");
                return Err(FetchError::Cancelled);
            }
            let chunk = chunk.map_err(|e| map_error(e, timeout))?;
            body.extend_from_slice(&chunk);
            if let Some(sender) = progress {
                sender.send(DownloadProgress::Progress {
                    file: file.clone(),
                    loaded: body.len() as u64,
                    total,
                });
            }
        }

        debug!(url = %file, status, bytes = body.len(), "Fetched");

        Ok(FetchedResponse {
            url: file,
            status,
            content_type,
            body,
        })
    }
}

fn map_error(error: reqwest::Error, timeout: Duration) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Http(error)
    }
}
