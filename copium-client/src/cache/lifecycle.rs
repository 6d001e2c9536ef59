//! Cache store lifecycle
//!
//! A build owns two versioned stores: one for shell assets and external
//! libraries, one for model weights. The lifecycle moves a build through
//! install (shell written as one unit), activate (superseded stores deleted
//! while routed reads are excluded) and claim (open contexts rebound).

use super::classifier::{CacheTier, ResourceClassifier};
use super::storage::{CacheStorage, CachedEntry};
use crate::error::CacheError;
use crate::fetch::{Fetch, ResourceRequest};
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, watch};
use tracing::{debug, error, info};
use url::Url;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Versioned store identity, rendered as `<name>-v<version>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreId {
    pub name: String,
    pub version: u32,
}

impl StoreId {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn cache_name(&self) -> String {
        format!("{}-v{}", self.name, self.version)
    }

    /// Split a cache name back into name and version
    pub fn parse(cache_name: &str) -> Option<Self> {
        let (name, version) = cache_name.rsplit_once("-v")?;
        Some(Self::new(name, version.parse().ok()?))
    }
}

/// A concrete store of the current build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedCacheStore {
    pub name: String,
    pub version: u32,
    pub tier: CacheTier,
}

/// Store names of one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNamespace {
    /// Shell assets and external libraries
    pub shell: StoreId,
    /// Model weights
    pub models: StoreId,
}

impl CacheNamespace {
    pub fn new(shell: StoreId, models: StoreId) -> Self {
        Self { shell, models }
    }

    /// Store that owns entries of `tier`
    pub fn store_for(&self, tier: CacheTier) -> NamedCacheStore {
        let (id, tier) = match tier {
            CacheTier::ModelWeights => (&self.models, CacheTier::ModelWeights),
            CacheTier::ShellAssets | CacheTier::ExternalLibraries => {
                (&self.shell, CacheTier::ShellAssets)
            }
        };
        NamedCacheStore {
            name: id.cache_name(),
            version: id.version,
            tier,
        }
    }

    pub fn current_names(&self) -> [String; 2] {
        [self.shell.cache_name(), self.models.cache_name()]
    }
}

/// Lifecycle state of the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Uninitialized,
    Installing,
    /// Installed, waiting to activate
    Waiting,
    Active,
    /// Install failed; the build never becomes active
    Failed,
}

/// Per-store view of the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Installing,
    Active,
    Superseded,
}

/// Open client contexts and the build controlling them
pub struct ClientRegistry {
    controller: watch::Sender<Option<u32>>,
    open: Arc<watch::Sender<usize>>,
}

impl ClientRegistry {
    fn new() -> Self {
        let (controller, _) = watch::channel(None);
        let (open, _) = watch::channel(0);
        Self {
            controller,
            open: Arc::new(open),
        }
    }

    fn connect(&self) -> ClientContext {
        self.open.send_modify(|n| *n += 1);
        ClientContext {
            controller: self.controller.subscribe(),
            open: Arc::clone(&self.open),
        }
    }

    fn claim(&self, build: u32) {
        self.controller.send_replace(Some(build));
    }

    fn open_count(&self) -> usize {
        *self.open.borrow()
    }
}

/// An open client session bound to some build
pub struct ClientContext {
    controller: watch::Receiver<Option<u32>>,
    open: Arc<watch::Sender<usize>>,
}

impl ClientContext {
    /// Build currently routing this context's requests
    pub fn controller(&self) -> Option<u32> {
        *self.controller.borrow()
    }

    /// Wait until the context is rebound to a different build
    pub async fn controller_changed(&mut self) -> Option<u32> {
        if self.controller.changed().await.is_err() {
            return self.controller();
        }
        *self.controller.borrow_and_update()
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.open.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Install/activate state machine for one build
pub struct CacheLifecycle {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetch>,
    classifier: ResourceClassifier,
    namespace: CacheNamespace,
    install_urls: Vec<Url>,
    state: watch::Sender<BuildState>,
    /// Routed reads hold this shared; store deletion holds it exclusively
    gate: RwLock<()>,
    transition: Mutex<()>,
    clients: ClientRegistry,
    skip_waiting: AtomicBool,
}

impl CacheLifecycle {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetch>,
        classifier: ResourceClassifier,
        namespace: CacheNamespace,
        install_urls: Vec<Url>,
    ) -> Self {
        let (state, _) = watch::channel(BuildState::Uninitialized);
        Self {
            storage,
            fetcher,
            classifier,
            namespace,
            install_urls,
            state,
            gate: RwLock::new(()),
            transition: Mutex::new(()),
            clients: ClientRegistry::new(),
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &CacheNamespace {
        &self.namespace
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn state(&self) -> BuildState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == BuildState::Active
    }

    /// Build identifier handed to claimed contexts
    pub fn build(&self) -> u32 {
        self.namespace.shell.version
    }

    /// Register an open client context
    pub fn connect(&self) -> ClientContext {
        self.clients.connect()
    }

    pub fn open_contexts(&self) -> usize {
        self.clients.open_count()
    }

    /// Shared guard held by the router while reading a store
    pub(crate) async fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Fetch the full install list and write it to the shell store as one unit
    ///
    /// Any asset failure fails the whole install and nothing is written.
    pub async fn install(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        match self.state() {
            BuildState::Waiting | BuildState::Active => return Ok(()),
            _ => {}
        }

        if let Err(e) = self.check_versions().await {
            self.state.send_replace(BuildState::Failed);
            return Err(e);
        }

        self.state.send_replace(BuildState::Installing);
        let shell = self.namespace.shell.cache_name();
        info!(store = %shell, assets = self.install_urls.len(), "Installing build");

        match self.install_shell(&shell).await {
            Ok(()) => {
                self.state.send_replace(BuildState::Waiting);
                info!(store = %shell, "Shell cached");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(BuildState::Failed);
                error!(store = %shell, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    async fn install_shell(&self, shell: &str) -> Result<()> {
        if self.already_installed(shell).await? {
            debug!(store = %shell, "Shell already present from a previous run");
            return Ok(());
        }

        let fetches = self.install_urls.iter().map(|url| async move {
            let request = ResourceRequest::get(url.clone());
            let response = self.fetcher.fetch(&request, None).await.map_err(|e| {
                CacheError::InstallFailed {
                    asset: url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if !response.is_success() {
                return Err(CacheError::InstallFailed {
                    asset: url.to_string(),
                    reason: format!("HTTP {}", response.status),
                });
            }
            let tier = self.classifier.route(&request).tier;
            Ok(CachedEntry::new(request.cache_key(), response.body, tier)
                .with_content_type(response.content_type))
        });

        let entries = try_join_all(fetches).await?;
        self.storage.put_all(shell, entries).await
    }

    async fn already_installed(&self, shell: &str) -> Result<bool> {
        if !self.storage.has_store(shell).await? {
            return Ok(false);
        }
        let keys = self.storage.keys(shell).await?;
        Ok(self
            .install_urls
            .iter()
            .all(|url| keys.iter().any(|k| k == url.as_str())))
    }

    /// Reject a build older than stores already on disk
    async fn check_versions(&self) -> Result<()> {
        for existing in self.storage.store_names().await? {
            let Some(existing) = StoreId::parse(&existing) else {
                continue;
            };
            for current in [&self.namespace.shell, &self.namespace.models] {
                if existing.name == current.name && existing.version > current.version {
                    return Err(CacheError::StaleBuild {
                        store: current.name.clone(),
                        version: current.version,
                        existing: existing.version,
                    });
                }
            }
        }
        Ok(())
    }

    /// Delete every store not belonging to this build, then claim contexts
    ///
    /// Returns the deleted store names. Routed reads are excluded until the
    /// whole deletion batch completes.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let _transition = self.transition.lock().await;
        match self.state() {
            BuildState::Active => return Ok(Vec::new()),
            BuildState::Waiting => {}
            _ => return Err(CacheError::NotInstalled),
        }

        info!(build = self.build(), "Activating build");
        let current = self.namespace.current_names();

        let deleted = {
            let _exclusive = self.gate.write().await;
            let stale: Vec<String> = self
                .storage
                .store_names()
                .await?
                .into_iter()
                .filter(|name| !current.contains(name))
                .collect();

            for name in &stale {
                info!(store = %name, "Deleting old cache");
            }
            let results = join_all(stale.iter().map(|name| self.storage.delete_store(name))).await;
            for result in results {
                result?;
            }
            stale
        };

        self.state.send_replace(BuildState::Active);
        self.clients.claim(self.build());
        info!(build = self.build(), deleted = deleted.len(), "Activated");
        Ok(deleted)
    }

    /// Activate a waiting build immediately
    ///
    /// Before install completes this only records the request, and
    /// [`CacheLifecycle::run`] activates right after install.
    pub async fn skip_waiting(&self) -> Result<Vec<String>> {
        self.skip_waiting.store(true, Ordering::SeqCst);
        if self.state() == BuildState::Waiting {
            return self.activate().await;
        }
        Ok(Vec::new())
    }

    /// Install, then activate once skip-wait is requested or no contexts
    /// remain open
    pub async fn run(&self) -> Result<()> {
        self.install().await?;

        if self.skip_waiting.load(Ordering::SeqCst) {
            self.activate().await?;
            return Ok(());
        }

        let mut open = self.clients.open.subscribe();
        let mut state = self.subscribe();
        let idle = async {
            let _ = open.wait_for(|n| *n == 0).await;
        };
        let activated_elsewhere = async {
            let _ = state.wait_for(|s| *s == BuildState::Active).await;
        };

        tokio::select! {
            _ = idle => {
                if self.state() == BuildState::Waiting {
                    self.activate().await?;
                }
            }
            _ = activated_elsewhere => {}
        }
        Ok(())
    }

    /// Per-store lifecycle view of the current and leftover stores
    pub async fn store_states(&self) -> Result<Vec<(String, StoreState)>> {
        let existing = self.storage.store_names().await?;
        let current = self.namespace.current_names();
        let current_state = match self.state() {
            BuildState::Installing | BuildState::Waiting => StoreState::Installing,
            BuildState::Active => StoreState::Active,
            BuildState::Uninitialized | BuildState::Failed => StoreState::Uninitialized,
        };

        let mut states: Vec<(String, StoreState)> = current
            .iter()
            .map(|name| {
                let state = if current_state == StoreState::Active && !existing.contains(name) {
                    // Model store is created lazily on first routed write
                    StoreState::Uninitialized
                } else {
                    current_state
                };
                (name.clone(), state)
            })
            .collect();

        for name in existing {
            if !current.contains(&name) {
                states.push((name, StoreState::Superseded));
            }
        }
        Ok(states)
    }

    /// Summed byte size of the model weights store
    pub async fn model_cache_size(&self) -> Result<u64> {
        let store = self.namespace.store_for(CacheTier::ModelWeights);
        let _shared = self.gate.read().await;
        let size = self.storage.store_size(&store.name).await?;
        debug!(store = %store.name, bytes = size, "Model cache size");
        Ok(size)
    }
}
