//! CopiumMeter client implementation

use crate::backend::{
    HeuristicBackend, ModelState, NoRuntime, OnDeviceModel, Reachability,
    RemoteApi, RuntimeProvider,
};
use crate::cache::{
    BuildState, CacheLifecycle, CacheNamespace, CacheRouter, CacheStorage, CacheWorkerHandle,
    ClientContext, DiskStorage, MemoryStorage, ResourceClassifier, StoreId, worker,
};
use crate::config::CopiumConfig;
use crate::error::Result;
use crate::fetch::{Fetch, HttpFetcher};
use crate::orchestrator::FallbackChain;
use crate::progress::{DownloadHandle, ProgressStream};
use crate::types::{BackendTier, ClassificationResult};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Severity of the current status, for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Success,
    Warning,
    Loading,
    Error,
}

/// Point-in-time view of the client's tiers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    pub model: ModelState,
    pub remote: Reachability,
    pub build: BuildState,
    pub heuristic_enabled: bool,
    /// Tiers that would be attempted right now, in order
    pub ready_tiers: Vec<BackendTier>,
}

impl ClientStatus {
    pub fn is_online(&self) -> bool {
        self.remote == Reachability::Reachable
    }

    pub fn level(&self) -> StatusLevel {
        match (self.remote, &self.model) {
            (Reachability::Reachable, _) => StatusLevel::Success,
            (_, ModelState::Loaded) => StatusLevel::Warning,
            (_, ModelState::Loading { .. }) => StatusLevel::Loading,
            (Reachability::Unknown, ModelState::NotLoaded) => StatusLevel::Loading,
            _ => StatusLevel::Error,
        }
    }

    /// One-line status, e.g. `Online - Local model ready`
    pub fn summary(&self) -> String {
        match (self.remote, &self.model) {
            (Reachability::Reachable, ModelState::Loaded) => "Online - Local model ready".into(),
            (Reachability::Reachable, _) => "Online - Using Cloud API".into(),
            (_, ModelState::Loaded) => "Offline - Local model ready".into(),
            (_, ModelState::Loading { percent }) => format!("Offline - Loading model... {percent}%"),
            (Reachability::Unknown, ModelState::NotLoaded) => "Initializing...".into(),
            (_, ModelState::Failed { .. }) => "Offline - Model not available".into(),
            (_, ModelState::NotLoaded) => "Offline - No model cached".into(),
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Builder for [`CopiumClient`]
///
/// Storage, fetcher and model runtime default to disk or memory storage
/// (per `cache.directory`), a reqwest fetcher and [`NoRuntime`].
pub struct CopiumClientBuilder {
    config: CopiumConfig,
    storage: Option<Arc<dyn CacheStorage>>,
    fetcher: Option<Arc<dyn Fetch>>,
    runtime: Option<Arc<dyn RuntimeProvider>>,
}

impl CopiumClientBuilder {
    pub fn new(config: CopiumConfig) -> Self {
        Self {
            config,
            storage: None,
            fetcher: None,
            runtime: None,
        }
    }

    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn RuntimeProvider>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Wire the client and start the cache worker
    pub async fn build(self) -> Result<CopiumClient> {
        let config = self.config;

        let storage: Arc<dyn CacheStorage> = match (self.storage, &config.cache.directory) {
            (Some(storage), _) => storage,
            (None, Some(dir)) => Arc::new(DiskStorage::open(dir).await?),
            (None, None) => Arc::new(MemoryStorage::new()),
        };
        let fetcher: Arc<dyn Fetch> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(config.remote_timeout())?),
        };
        let runtime = self.runtime.unwrap_or_else(|| Arc::new(NoRuntime));

        let classifier = ResourceClassifier::new(
            config.cache.model_hosts.clone(),
            config.cache.library_hosts.clone(),
        );
        let namespace = CacheNamespace::new(
            StoreId::new(&config.cache.shell_store, config.cache.shell_version),
            StoreId::new(&config.cache.model_store, config.cache.model_version),
        );
        let lifecycle = Arc::new(CacheLifecycle::new(
            storage,
            Arc::clone(&fetcher),
            classifier.clone(),
            namespace,
            config.install_urls()?,
        ));
        if config.cache.skip_waiting {
            lifecycle.skip_waiting().await?;
        }
        let router = Arc::new(CacheRouter::new(
            classifier,
            Arc::clone(&lifecycle),
            fetcher,
            config.entry_point_url()?,
        ));

        let on_device = Arc::new(
            OnDeviceModel::new(
                &config.model.model_id,
                config.model_file_urls()?,
                Arc::clone(&router),
                runtime,
            )
            .with_runtime_polling(config.model.runtime_poll_attempts, config.runtime_poll_interval()),
        );
        let remote = Arc::new(
            RemoteApi::new(config.endpoint_url()?, Arc::clone(&router), config.remote_timeout())
                .with_probe_timeout(config.probe_timeout()),
        );

        let mut chain = FallbackChain::new()
            .with_backend(on_device.clone())
            .with_backend(remote.clone());
        if config.fallback.heuristic_enabled {
            let policy = config.fallback.heuristic_policy.clone().unwrap_or_default();
            debug!(version = policy.version, rules = policy.rules.len(), "Heuristic policy");
            chain = chain.with_backend(Arc::new(HeuristicBackend::new(policy.compile()?)));
        }

        let (control, worker) = worker::spawn(Arc::clone(&lifecycle));
        info!(
            build = lifecycle.build(),
            tiers = ?chain.tiers(),
            "CopiumMeter client ready"
        );

        Ok(CopiumClient {
            config: Arc::new(config),
            lifecycle,
            router,
            on_device,
            remote,
            chain,
            control,
            _worker: Arc::new(worker),
        })
    }
}

/// Main CopiumMeter client
#[derive(Clone)]
pub struct CopiumClient {
    config: Arc<CopiumConfig>,
    lifecycle: Arc<CacheLifecycle>,
    router: Arc<CacheRouter>,
    on_device: Arc<OnDeviceModel>,
    remote: Arc<RemoteApi>,
    chain: FallbackChain,
    control: CacheWorkerHandle,
    _worker: Arc<JoinHandle<()>>,
}

impl CopiumClient {
    /// Build a client with default collaborators
    pub async fn new(config: CopiumConfig) -> Result<Self> {
        CopiumClientBuilder::new(config).build().await
    }

    pub fn builder(config: CopiumConfig) -> CopiumClientBuilder {
        CopiumClientBuilder::new(config)
    }

    pub fn config(&self) -> &CopiumConfig {
        &self.config
    }

    /// Classify text through the fallback chain
    pub async fn analyze(&self, text: &str) -> Result<ClassificationResult> {
        Ok(self.chain.classify(text).await?)
    }

    /// Probe the remote endpoint; returns whether it is reachable
    pub async fn refresh_connectivity(&self) -> bool {
        self.remote.probe().await
    }

    /// Forward an online/offline notification from the host
    pub async fn set_online(&self, online: bool) -> bool {
        self.remote.set_online(online).await
    }

    /// Start loading the on-device model in the background
    ///
    /// `None` when a load is already running or done.
    pub fn load_model(&self) -> Option<(ProgressStream, DownloadHandle)> {
        self.on_device.start_loading()
    }

    pub fn model_state(&self) -> ModelState {
        self.on_device.state()
    }

    /// Receiver of model load state changes
    pub fn watch_model(&self) -> watch::Receiver<ModelState> {
        self.on_device.subscribe()
    }

    pub fn status(&self) -> ClientStatus {
        use crate::backend::Backend;

        let ready_tiers = [
            (BackendTier::OnDeviceModel, self.on_device.is_ready()),
            (BackendTier::RemoteApi, self.remote.is_ready()),
            (
                BackendTier::HeuristicScorer,
                self.config.fallback.heuristic_enabled,
            ),
        ]
        .into_iter()
        .filter_map(|(tier, ready)| ready.then_some(tier))
        .collect();

        ClientStatus {
            model: self.on_device.state(),
            remote: self.remote.reachability(),
            build: self.lifecycle.state(),
            heuristic_enabled: self.config.fallback.heuristic_enabled,
            ready_tiers,
        }
    }

    /// Wait until the build is active or its install has failed
    pub async fn wait_for_build(&self) -> BuildState {
        let mut state = self.lifecycle.subscribe();
        let settled = state
            .wait_for(|s| matches!(s, BuildState::Active | BuildState::Failed))
            .await
            .map(|s| *s);
        settled.unwrap_or_else(|_| self.lifecycle.state())
    }

    /// Control channel of the cache worker
    pub fn control(&self) -> &CacheWorkerHandle {
        &self.control
    }

    /// Register an open client context with the cache lifecycle
    pub fn connect_context(&self) -> ClientContext {
        self.lifecycle.connect()
    }

    pub fn lifecycle(&self) -> &Arc<CacheLifecycle> {
        &self.lifecycle
    }

    /// Router every outbound request goes through
    pub fn router(&self) -> &Arc<CacheRouter> {
        &self.router
    }
}
