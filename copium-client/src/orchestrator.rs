//! Fallback chain
//!
//! Walks the backend tiers in priority order, attempting the first ready one
//! and normalizing its output. A failed tier never ends the request: the
//! chain advances, and a failed remote call first retries laterally on the
//! on-device model if that has become ready in the meantime. Only an
//! exhausted chain is reported as [`ClassifyError::NoBackendAvailable`].

use crate::backend::Backend;
use crate::error::{AttemptFailure, BackendError, ClassifyError};
use crate::normalize::normalize;
use crate::types::{BackendTier, ClassificationResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, ClassifyError>;

/// Ordered set of inference tiers
#[derive(Default, Clone)]
pub struct FallbackChain {
    backends: Vec<Arc<dyn Backend>>,
}

impl FallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tier, replacing any backend already registered for it
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.retain(|b| b.tier() != backend.tier());
        self.backends.push(backend);
        self
    }

    pub fn tiers(&self) -> Vec<BackendTier> {
        let mut tiers: Vec<BackendTier> = self.backends.iter().map(|b| b.tier()).collect();
        tiers.sort();
        tiers
    }

    fn backend(&self, tier: BackendTier) -> Option<&Arc<dyn Backend>> {
        self.backends.iter().find(|b| b.tier() == tier)
    }

    /// Classify `text` with the first tier that succeeds
    ///
    /// Callers keep at most one request in flight per session.
    pub async fn classify(&self, text: &str) -> Result<ClassificationResult> {
        if text.trim().is_empty() {
            return Err(ClassifyError::Validation("input text is empty".to_string()));
        }

        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut tried: Vec<BackendTier> = Vec::new();

        for tier in BackendTier::PRIORITY {
            if tried.contains(&tier) {
                continue;
            }
            let Some(backend) = self.backend(tier) else {
                continue;
            };
            if !backend.is_ready() {
                debug!(%tier, "Backend not ready, skipping");
                attempts.push(AttemptFailure {
                    tier,
                    error: BackendError::Unavailable(tier),
                });
                continue;
            }

            tried.push(tier);
            match self.attempt(backend.as_ref(), text).await {
                Ok(result) => return Ok(result),
                Err(error) => attempts.push(AttemptFailure { tier, error }),
            }

            if tier == BackendTier::RemoteApi {
                if let Some(result) = self.lateral_recovery(text, &mut tried, &mut attempts).await {
                    return Ok(result);
                }
            }
        }

        warn!(attempts = attempts.len(), "Every backend tier failed");
        Err(ClassifyError::NoBackendAvailable { attempts })
    }

    /// Retry once on the on-device model if it became ready after it was
    /// skipped
    async fn lateral_recovery(
        &self,
        text: &str,
        tried: &mut Vec<BackendTier>,
        attempts: &mut Vec<AttemptFailure>,
    ) -> Option<ClassificationResult> {
        let tier = BackendTier::OnDeviceModel;
        if tried.contains(&tier) {
            return None;
        }
        let backend = self.backend(tier).filter(|b| b.is_ready())?;

        info!("Remote API failed, recovering with the on-device model");
        tried.push(tier);
        match self.attempt(backend.as_ref(), text).await {
            Ok(result) => Some(result),
            Err(error) => {
                attempts.push(AttemptFailure { tier, error });
                None
            }
        }
    }

    async fn attempt(
        &self,
        backend: &dyn Backend,
        text: &str,
    ) -> std::result::Result<ClassificationResult, BackendError> {
        let tier = backend.tier();
        debug!(%tier, "Attempting backend");

        let outcome = match backend.infer(text).await {
            Ok(raw) => normalize(tier, raw),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(result) => info!(
                %tier,
                label = %result.label,
                confidence = result.confidence,
                "Classified"
            ),
            Err(e) => warn!(%tier, error = %e, "Backend attempt failed"),
        }
        outcome
    }
}
