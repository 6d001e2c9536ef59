//! Error types for the CopiumMeter client

use crate::types::BackendTier;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, CopiumError>;

/// Top-level client error
#[derive(Error, Debug)]
pub enum CopiumError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Network fetch errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Request exceeded its time bound
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Download was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,
}

/// Cache layer errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Storage I/O error
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store index could not be (de)serialized
    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store name unusable by the storage backend
    #[error("invalid store name: {0}")]
    InvalidStoreName(String),

    /// A shell asset could not be fetched during install
    #[error("install failed, asset {asset} unavailable: {reason}")]
    InstallFailed { asset: String, reason: String },

    /// Install attempted with a version older than one already present
    #[error("store {store} v{version} is older than installed v{existing}")]
    StaleBuild {
        store: String,
        version: u32,
        existing: u32,
    },

    /// Activation requested before a successful install
    #[error("build is not installed")]
    NotInstalled,

    /// Network failed and no cached copy exists
    #[error("network error with no cached fallback: {0}")]
    Network(#[from] FetchError),

    /// Background cache worker is gone
    #[error("cache worker stopped")]
    WorkerStopped,
}

/// Failure of a single backend attempt
///
/// Every variant is recovered inside the fallback chain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Tier not ready at attempt time
    #[error("{0} is not available")]
    Unavailable(BackendTier),

    /// Transient error from a ready tier (network, timeout, runtime)
    #[error("{tier} failed: {reason}")]
    Failure { tier: BackendTier, reason: String },

    /// Backend returned output the normalizer cannot parse
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl BackendError {
    pub fn failure(tier: BackendTier, reason: impl fmt::Display) -> Self {
        Self::Failure {
            tier,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse(reason.into())
    }
}

/// One failed step of the fallback chain
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub tier: BackendTier,
    pub error: BackendError,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.error)
    }
}

/// Errors surfaced to callers of `classify`
#[derive(Error, Debug)]
pub enum ClassifyError {
    /// Input rejected before any backend ran
    #[error("validation error: {0}")]
    Validation(String),

    /// Every tier was unavailable or failed
    #[error("no backend available ({})", summarize(.attempts))]
    NoBackendAvailable { attempts: Vec<AttemptFailure> },
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no tiers configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error raised by an on-device model runtime
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct RuntimeError(pub String);

/// Errors from the background model load
#[derive(Error, Debug)]
pub enum ModelLoadError {
    /// Runtime never became available within the polling budget
    #[error("model runtime not available after {attempts} attempts")]
    RuntimeUnavailable { attempts: u32 },

    /// Weight download failed
    #[error("weight download failed: {0}")]
    Download(#[from] CacheError),

    /// Weight host answered with an error status
    #[error("weight file {file} returned HTTP {status}")]
    BadStatus { file: String, status: u16 },

    /// Runtime refused the weights
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Load was cancelled through its handle
    #[error("model load cancelled")]
    Cancelled,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
