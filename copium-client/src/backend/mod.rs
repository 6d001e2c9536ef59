//! Inference backends
//!
//! Each adapter wraps one inference source and returns its native output;
//! [`crate::normalize`] turns that into a [`crate::types::ClassificationResult`].
//! Readiness is queried at attempt time from state the adapter owns.

pub mod heuristic;
pub mod on_device;
pub mod remote;

use crate::error::BackendError;
use crate::types::BackendTier;
use async_trait::async_trait;

pub use heuristic::{HeuristicBackend, HeuristicPolicy, HeuristicScorer, LabelCounts};
pub use on_device::{
    LabelProbability, ModelRuntime, ModelState, NoRuntime, OnDeviceModel, RankedLabel,
    RuntimeProvider, StaticRuntime, TextClassifier,
};
pub use remote::{Reachability, RemoteApi};

/// Backend-native output, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// Per-label probabilities in `[0, 1]`
    OnDevice(Vec<LabelProbability>),
    /// Markdown payload returned by the remote endpoint
    Remote(String),
    /// Weighted pattern match counts
    Heuristic(LabelCounts),
}

/// A single inference tier
#[async_trait]
pub trait Backend: Send + Sync {
    fn tier(&self) -> BackendTier;

    /// Whether the tier can be attempted right now
    fn is_ready(&self) -> bool;

    async fn infer(&self, text: &str) -> Result<RawOutput, BackendError>;
}
