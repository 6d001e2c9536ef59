//! Remote inference backend
//!
//! Talks to the hosted classification endpoint through the cache router.
//! Readiness is the result of the last reachability probe; requests never
//! re-probe on their own.

use super::{Backend, RawOutput};
use crate::cache::CacheRouter;
use crate::error::BackendError;
use crate::fetch::ResourceRequest;
use crate::types::BackendTier;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Last known reachability of the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    /// Not probed yet
    Unknown,
    Reachable,
    Unreachable,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    data: [&'a str; 1],
}

#[derive(Deserialize)]
struct PredictResponse {
    data: Vec<Value>,
}

pub struct RemoteApi {
    endpoint: Url,
    probe_url: Url,
    router: Arc<CacheRouter>,
    timeout: Duration,
    probe_timeout: Duration,
    reachability: RwLock<Reachability>,
}

impl RemoteApi {
    pub fn new(endpoint: Url, router: Arc<CacheRouter>, timeout: Duration) -> Self {
        let probe_url = probe_url(&endpoint);
        Self {
            endpoint,
            probe_url,
            router,
            timeout,
            probe_timeout: timeout,
            reachability: RwLock::new(Reachability::Unknown),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn reachability(&self) -> Reachability {
        *self.reachability.read()
    }

    /// Probe the endpoint's base path and record the outcome
    ///
    /// Non-2xx, transport errors and timeouts all count as unreachable.
    pub async fn probe(&self) -> bool {
        let request = ResourceRequest::get(self.probe_url.clone())
            .no_store()
            .with_timeout(self.probe_timeout);

        let reachable = match self.router.handle(&request).await {
            Ok(routed) if routed.response.is_success() => true,
            Ok(routed) => {
                debug!(status = routed.response.status, "Probe returned error status");
                false
            }
            Err(e) => {
                debug!(error = %e, "Probe failed");
                false
            }
        };

        let state = if reachable {
            Reachability::Reachable
        } else {
            Reachability::Unreachable
        };
        *self.reachability.write() = state;
        info!(url = %self.probe_url, ?state, "Remote API probed");
        reachable
    }

    /// Forward a host connectivity change
    ///
    /// Going offline takes effect immediately; coming online re-probes.
    pub async fn set_online(&self, online: bool) -> bool {
        if online {
            self.probe().await
        } else {
            *self.reachability.write() = Reachability::Unreachable;
            info!("Remote API marked offline");
            false
        }
    }
}

/// Base path of the endpoint: `/api/predict` is replaced by `/`
fn probe_url(endpoint: &Url) -> Url {
    let mut url = endpoint.clone();
    let path = endpoint.path();
    let base = path.strip_suffix("api/predict").unwrap_or(path).to_string();
    url.set_path(&base);
    url.set_query(None);
    url
}

#[async_trait]
impl Backend for RemoteApi {
    fn tier(&self) -> BackendTier {
        BackendTier::RemoteApi
    }

    fn is_ready(&self) -> bool {
        self.reachability() == Reachability::Reachable
    }

    async fn infer(&self, text: &str) -> Result<RawOutput, BackendError> {
        let tier = BackendTier::RemoteApi;
        let request = ResourceRequest::post_json(self.endpoint.clone(), &PredictRequest { data: [text] })
            .map_err(|e| BackendError::failure(tier, e))?
            .with_timeout(self.timeout);

        let routed = self
            .router
            .handle(&request)
            .await
            .map_err(|e| BackendError::failure(tier, e))?;

        let response = routed.response;
        if !response.is_success() {
            warn!(status = response.status, "Remote API returned error status");
            return Err(BackendError::failure(tier, format!("HTTP {}", response.status)));
        }

        let body: PredictResponse = serde_json::from_slice(&response.body)
            .map_err(|e| BackendError::malformed(format!("invalid response body: {e}")))?;
        let markdown = body
            .data
            .into_iter()
            .next()
            .and_then(|value| value.as_str().map(String::from))
            .ok_or_else(|| BackendError::malformed("response has no text in data[0]"))?;

        Ok(RawOutput::Remote(markdown))
    }
}
