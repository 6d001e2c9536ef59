//! Resource classification
//!
//! Maps an outbound request to the cache tier that owns it and the strategy
//! the router applies. Pure and total: unmatched requests are shell assets.

use crate::fetch::{CacheMode, Method, ResourceRequest};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing class of a cached resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    /// The application's own static assets
    ShellAssets,
    /// Third-party script and font bundles
    ExternalLibraries,
    /// Downloaded model weights, kept in a dedicated store
    ModelWeights,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ShellAssets => "shell",
            Self::ExternalLibraries => "library",
            Self::ModelWeights => "model",
        };
        f.write_str(name)
    }
}

/// How the router answers a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Serve from the tier's store; on a miss fetch and populate the store
    CacheFirst,
    /// Always go to the network, never touch a store
    NetworkOnly,
}

/// Classification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub tier: CacheTier,
    pub strategy: Strategy,
}

/// Host match rule
///
/// Matches when the hostname contains `host` and, if set, the path contains
/// `path_contains`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_contains: Option<String>,
}

impl HostRule {
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path_contains: None,
        }
    }

    pub fn with_path(mut self, fragment: impl Into<String>) -> Self {
        self.path_contains = Some(fragment.into());
        self
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        host.contains(self.host.as_str())
            && self
                .path_contains
                .as_deref()
                .is_none_or(|fragment| path.contains(fragment))
    }
}

/// Request-to-tier routing table
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceClassifier {
    model_hosts: Vec<HostRule>,
    library_hosts: Vec<HostRule>,
}

impl ResourceClassifier {
    pub fn new(model_hosts: Vec<HostRule>, library_hosts: Vec<HostRule>) -> Self {
        Self {
            model_hosts,
            library_hosts,
        }
    }

    /// Classify by hostname and path, most specific rule first
    pub fn classify(&self, host: &str, path: &str) -> Route {
        let tier = if self.model_hosts.iter().any(|r| r.matches(host, path)) {
            CacheTier::ModelWeights
        } else if self.library_hosts.iter().any(|r| r.matches(host, path)) {
            CacheTier::ExternalLibraries
        } else {
            CacheTier::ShellAssets
        };

        Route {
            tier,
            strategy: Strategy::CacheFirst,
        }
    }

    /// Classify a full request; non-GET and no-store requests bypass stores
    pub fn route(&self, request: &ResourceRequest) -> Route {
        let route = self.classify(request.host(), request.url.path());
        if request.method != Method::Get || request.cache_mode == CacheMode::NoStore {
            return Route {
                strategy: Strategy::NetworkOnly,
                ..route
            };
        }
        route
    }
}

impl Default for ResourceClassifier {
    fn default() -> Self {
        let cache = crate::config::CacheConfig::default();
        Self::new(cache.model_hosts, cache.library_hosts)
    }
}
