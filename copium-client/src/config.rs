//! Client configuration
//!
//! Loaded from YAML with every section defaulted, or assembled in code with
//! the `with_*` builder methods.

use crate::backend::heuristic::HeuristicPolicy;
use crate::cache::classifier::HostRule;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CopiumConfig {
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub model: ModelConfig,
    pub fallback: FallbackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Classification endpoint
    pub endpoint: String,
    /// Bound on a classification request
    pub timeout_ms: u64,
    /// Bound on an availability probe
    pub probe_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://kurtesianplane-copium-meter.hf.space/api/predict".to_string(),
            timeout_ms: 5000,
            probe_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for persistent stores; stores live in memory when unset
    pub directory: Option<PathBuf>,
    /// The application's own origin, used to resolve shell asset paths
    pub origin: String,
    pub shell_store: String,
    pub shell_version: u32,
    pub model_store: String,
    pub model_version: u32,
    /// Shell assets written atomically at install
    pub shell_assets: Vec<String>,
    /// External library URLs written with the shell at install
    pub precache: Vec<String>,
    /// Shell entry point served to offline navigations
    pub entry_point: String,
    /// Hosts serving model weights
    pub model_hosts: Vec<HostRule>,
    /// Hosts serving third-party script and font bundles
    pub library_hosts: Vec<HostRule>,
    /// Activate right after install instead of waiting for open contexts
    pub skip_waiting: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            origin: "https://kurtesianplane.github.io/copium-meter/".to_string(),
            shell_store: "copiummeter".to_string(),
            shell_version: 4,
            model_store: "copiummeter-models".to_string(),
            model_version: 4,
            shell_assets: [
                "./",
                "./index.html",
                "./style.css",
                "./app.js",
                "./manifest.json",
                "./icons/icon-192.png",
                "./icons/icon-512.png",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            precache: vec![
                "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600;700&display=swap"
                    .to_string(),
            ],
            entry_point: "./index.html".to_string(),
            model_hosts: vec![
                HostRule::host("huggingface.co"),
                HostRule::host("cdn-lfs"),
                HostRule::host("hf.co"),
            ],
            library_hosts: vec![
                HostRule::host("cdn.jsdelivr.net").with_path("transformers"),
                HostRule::host("fonts.googleapis.com"),
                HostRule::host("fonts.gstatic.com"),
            ],
            skip_waiting: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_id: String,
    /// Weight files downloaded through the cache router
    pub files: Vec<String>,
    /// Polls for the runtime before giving up
    pub runtime_poll_attempts: u32,
    pub runtime_poll_interval_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let base = "https://huggingface.co/kurtesianplane/copium-meter/resolve/main";
        Self {
            model_id: "kurtesianplane/copium-meter".to_string(),
            files: [
                "config.json",
                "tokenizer.json",
                "tokenizer_config.json",
                "onnx/model_quantized.onnx",
            ]
            .iter()
            .map(|file| format!("{base}/{file}"))
            .collect(),
            runtime_poll_attempts: 50,
            runtime_poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Keep the heuristic scorer as the terminal tier
    pub heuristic_enabled: bool,
    /// Replacement for the built-in heuristic policy
    pub heuristic_policy: Option<HeuristicPolicy>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            heuristic_enabled: true,
            heuristic_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl CopiumConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Set the remote classification endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.remote.endpoint = endpoint.into();
        self
    }

    /// Set the bound on classification requests and probes
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_millis() as u64;
        self.remote.timeout_ms = millis;
        self.remote.probe_timeout_ms = millis;
        self
    }

    /// Persist cache stores under `directory`
    pub fn with_cache_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.cache.directory = Some(directory.into());
        self
    }

    /// Set the application origin shell assets resolve against
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.cache.origin = origin.into();
        self
    }

    /// Set the shell and model store versions for this build
    pub fn with_versions(mut self, shell_version: u32, model_version: u32) -> Self {
        self.cache.shell_version = shell_version;
        self.cache.model_version = model_version;
        self
    }

    /// Replace the model weight file list
    pub fn with_model_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model.files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Drop the heuristic scorer from the fallback chain
    pub fn without_heuristic(mut self) -> Self {
        self.fallback.heuristic_enabled = false;
        self
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.probe_timeout_ms)
    }

    pub fn runtime_poll_interval(&self) -> Duration {
        Duration::from_millis(self.model.runtime_poll_interval_ms)
    }

    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        parse_url(&self.remote.endpoint)
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        parse_url(&self.cache.origin)
    }

    /// Entry point resolved against the origin
    pub fn entry_point_url(&self) -> Result<Url, ConfigError> {
        resolve(&self.origin_url()?, &self.cache.entry_point)
    }

    /// Full install list: shell assets resolved against the origin, then
    /// external precache URLs
    pub fn install_urls(&self) -> Result<Vec<Url>, ConfigError> {
        let origin = self.origin_url()?;
        let mut urls = self
            .cache
            .shell_assets
            .iter()
            .map(|asset| resolve(&origin, asset))
            .collect::<Result<Vec<_>, _>>()?;
        for url in &self.cache.precache {
            urls.push(parse_url(url)?);
        }
        Ok(urls)
    }

    pub fn model_file_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.model.files.iter().map(|f| parse_url(f)).collect()
    }
}

fn parse_url(url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
        url: url.to_string(),
        source,
    })
}

fn resolve(base: &Url, path: &str) -> Result<Url, ConfigError> {
    base.join(path).map_err(|source| ConfigError::InvalidUrl {
        url: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CopiumConfig::default();
        assert_eq!(config.remote.timeout_ms, 5000);
        assert_eq!(config.cache.shell_store, "copiummeter");
        assert_eq!(config.cache.model_store, "copiummeter-models");
        assert_eq!(config.cache.shell_version, 4);
        assert_eq!(config.model.runtime_poll_attempts, 50);
        assert!(config.fallback.heuristic_enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_builder() {
        let config = CopiumConfig::default()
            .with_endpoint("http://localhost:7860/api/predict")
            .with_timeout(Duration::from_secs(2))
            .with_versions(5, 3)
            .without_heuristic();

        assert_eq!(config.remote.endpoint, "http://localhost:7860/api/predict");
        assert_eq!(config.remote_timeout(), Duration::from_secs(2));
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.cache.shell_version, 5);
        assert_eq!(config.cache.model_version, 3);
        assert!(!config.fallback.heuristic_enabled);
    }

    #[test]
    fn test_install_urls_resolve_against_origin() {
        let config = CopiumConfig::default().with_origin("http://localhost:8080/app/");
        let urls = config.install_urls().unwrap();

        assert_eq!(urls[0].as_str(), "http://localhost:8080/app/");
        assert_eq!(urls[1].as_str(), "http://localhost:8080/app/index.html");
        assert_eq!(urls.len(), 8);
        assert_eq!(
            config.entry_point_url().unwrap().as_str(),
            "http://localhost:8080/app/index.html"
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
remote:
  endpoint: "http://127.0.0.1:9000/api/predict"
cache:
  shell_version: 7
"#;
        let config = CopiumConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.remote.endpoint, "http://127.0.0.1:9000/api/predict");
        assert_eq!(config.remote.timeout_ms, 5000);
        assert_eq!(config.cache.shell_version, 7);
        assert_eq!(config.cache.model_version, 4);
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let config = CopiumConfig::default().with_endpoint("not a url");
        assert!(matches!(
            config.endpoint_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
