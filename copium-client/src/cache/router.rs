//! Cache router
//!
//! Every outbound request passes through [`CacheRouter::handle`], which runs
//! the strategy chosen by the classifier against the active build's stores.

use super::classifier::{CacheTier, ResourceClassifier, Strategy};
use super::lifecycle::CacheLifecycle;
use super::storage::CachedEntry;
use crate::error::CacheError;
use crate::fetch::{Fetch, FetchedResponse, RequestMode, ResourceRequest};
use crate::progress::{DownloadProgress, ProgressSender};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Where a routed response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Hit in the tier's store
    Cache,
    /// Fetched from the network (and stored when cacheable)
    Network,
    /// Navigation answered with the cached shell entry point
    OfflineShell,
    /// No active build yet; passed straight to the network (model weights excepted)
    Uncontrolled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResponse {
    pub response: FetchedResponse,
    pub source: ResponseSource,
    pub tier: CacheTier,
}

pub struct CacheRouter {
    classifier: ResourceClassifier,
    lifecycle: Arc<CacheLifecycle>,
    fetcher: Arc<dyn Fetch>,
    entry_point: Url,
}

impl CacheRouter {
    pub fn new(
        classifier: ResourceClassifier,
        lifecycle: Arc<CacheLifecycle>,
        fetcher: Arc<dyn Fetch>,
        entry_point: Url,
    ) -> Self {
        Self {
            classifier,
            lifecycle,
            fetcher,
            entry_point,
        }
    }

    pub fn lifecycle(&self) -> &Arc<CacheLifecycle> {
        &self.lifecycle
    }

    pub async fn handle(&self, request: &ResourceRequest) -> Result<RoutedResponse> {
        self.handle_with_progress(request, None).await
    }

    /// Route a request, reporting body progress to `progress`
    pub async fn handle_with_progress(
        &self,
        request: &ResourceRequest,
        progress: Option<&ProgressSender>,
    ) -> Result<RoutedResponse> {
        let route = self.classifier.route(request);

        // The model store outlives shell builds, so weights are cached even
        // while a build is still installing
        let weights = route.tier == CacheTier::ModelWeights && route.strategy == Strategy::CacheFirst;
        if !self.lifecycle.is_active() && !weights {
            debug!(url = %request.url, "No active build, passing through");
            let response = self.fetcher.fetch(request, progress).await?;
            return Ok(RoutedResponse {
                response,
                source: ResponseSource::Uncontrolled,
                tier: route.tier,
            });
        }

        match route.strategy {
            Strategy::NetworkOnly => {
                let response = self.fetcher.fetch(request, progress).await?;
                Ok(RoutedResponse {
                    response,
                    source: ResponseSource::Network,
                    tier: route.tier,
                })
            }
            Strategy::CacheFirst => self.cache_first(request, route.tier, progress).await,
        }
    }

    async fn cache_first(
        &self,
        request: &ResourceRequest,
        tier: CacheTier,
        progress: Option<&ProgressSender>,
    ) -> Result<RoutedResponse> {
        let store = self.lifecycle.namespace().store_for(tier).name;
        let key = request.cache_key();

        if let Some(entry) = self.lookup(&store, &key).await? {
            debug!(store = %store, url = %key, "Cache hit");
            report_cached(progress, &entry);
            return Ok(routed(entry, ResponseSource::Cache, tier));
        }

        debug!(store = %store, url = %key, %tier, "Cache miss, fetching");
        match self.fetcher.fetch(request, progress).await {
            Ok(response) => {
                if response.is_success() {
                    let entry = CachedEntry::new(key.clone(), response.body.clone(), tier)
                        .with_content_type(response.content_type.clone());
                    // Concurrent misses may both write; payloads for a key are identical
                    if let Err(e) = self.lifecycle.storage().put(&store, entry).await {
                        warn!(store = %store, url = %key, error = %e, "Failed to populate cache");
                    } else {
                        debug!(store = %store, url = %key, bytes = response.body.len(), "Cached");
                    }
                }
                Ok(RoutedResponse {
                    response,
                    source: ResponseSource::Network,
                    tier,
                })
            }
            Err(fetch_error) => {
                warn!(url = %key, error = %fetch_error, "Fetch failed");

                if let Some(entry) = self.lookup(&store, &key).await? {
                    return Ok(routed(entry, ResponseSource::Cache, tier));
                }

                if request.mode == RequestMode::Navigate {
                    let shell = self.lifecycle.namespace().store_for(CacheTier::ShellAssets).name;
                    if let Some(entry) = self.lookup(&shell, self.entry_point.as_str()).await? {
                        debug!(url = %key, "Serving cached shell for offline navigation");
                        return Ok(routed(entry, ResponseSource::OfflineShell, tier));
                    }
                }

                Err(CacheError::Network(fetch_error))
            }
        }
    }

    async fn lookup(&self, store: &str, key: &str) -> Result<Option<CachedEntry>> {
        let _shared = self.lifecycle.read_gate().await;
        self.lifecycle.storage().get(store, key).await
    }
}

fn routed(entry: CachedEntry, source: ResponseSource, tier: CacheTier) -> RoutedResponse {
    RoutedResponse {
        response: FetchedResponse {
            url: entry.request_key,
            status: 200,
            content_type: entry.content_type,
            body: entry.payload,
        },
        source,
        tier,
    }
}

fn report_cached(progress: Option<&ProgressSender>, entry: &CachedEntry) {
    if let Some(sender) = progress {
        sender.send(DownloadProgress::Done {
            file: entry.request_key.clone(),
            bytes: entry.size(),
            from_cache: true,
        });
    }
}
