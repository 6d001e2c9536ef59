//! Background cache worker
//!
//! Owns the build lifecycle on its own task and answers control messages
//! from client contexts.

use super::lifecycle::CacheLifecycle;
use crate::error::CacheError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type Result<T> = std::result::Result<T, CacheError>;

/// Messages a client context may send to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Activate the waiting build now
    SkipWaiting,
    /// Report the byte size of the model weights store
    ReportModelCacheSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// Stores deleted by the activation (empty if already active)
    Activated { deleted: Vec<String> },
    ModelCacheSize(u64),
}

type Envelope = (ControlMessage, oneshot::Sender<Result<ControlReply>>);

/// Sending side of the worker's control channel
#[derive(Clone)]
pub struct CacheWorkerHandle {
    tx: mpsc::Sender<Envelope>,
}

impl CacheWorkerHandle {
    /// Send a message and wait for its reply
    pub async fn send(&self, message: ControlMessage) -> Result<ControlReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((message, reply_tx))
            .await
            .map_err(|_| CacheError::WorkerStopped)?;
        reply_rx.await.map_err(|_| CacheError::WorkerStopped)?
    }

    pub async fn skip_waiting(&self) -> Result<Vec<String>> {
        match self.send(ControlMessage::SkipWaiting).await? {
            ControlReply::Activated { deleted } => Ok(deleted),
            ControlReply::ModelCacheSize(_) => Ok(Vec::new()),
        }
    }

    pub async fn model_cache_size(&self) -> Result<u64> {
        match self.send(ControlMessage::ReportModelCacheSize).await? {
            ControlReply::ModelCacheSize(size) => Ok(size),
            ControlReply::Activated { .. } => Ok(0),
        }
    }
}

/// Spawn the worker: runs the lifecycle and serves control messages until
/// every handle is dropped
pub fn spawn(lifecycle: Arc<CacheLifecycle>) -> (CacheWorkerHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Envelope>(32);

    let task = tokio::spawn(async move {
        let runner = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move {
                if let Err(e) = lifecycle.run().await {
                    error!(error = %e, "Cache lifecycle failed");
                }
            })
        };

        while let Some((message, reply)) = rx.recv().await {
            debug!(?message, "Control message");
            let result = match message {
                ControlMessage::SkipWaiting => lifecycle
                    .skip_waiting()
                    .await
                    .map(|deleted| ControlReply::Activated { deleted }),
                ControlMessage::ReportModelCacheSize => lifecycle
                    .model_cache_size()
                    .await
                    .map(ControlReply::ModelCacheSize),
            };
            if reply.send(result).is_err() {
                warn!(?message, "Control reply dropped");
            }
        }

        debug!("Control channel closed, cache worker exiting");
        let _ = runner.await;
    });

    (CacheWorkerHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::classifier::{CacheTier, ResourceClassifier};
    use crate::cache::lifecycle::{BuildState, CacheNamespace, StoreId};
    use crate::cache::storage::{CacheStorage, CachedEntry, MemoryStorage};
    use crate::error::FetchError;
    use crate::fetch::{Fetch, FetchedResponse, ResourceRequest};
    use crate::progress::ProgressSender;
    use async_trait::async_trait;
    use url::Url;

    struct Echo;

    #[async_trait]
    impl Fetch for Echo {
        async fn fetch(
            &self,
            request: &ResourceRequest,
            _progress: Option<&ProgressSender>,
        ) -> std::result::Result<FetchedResponse, FetchError> {
            Ok(FetchedResponse {
                url: request.cache_key(),
                status: 200,
                content_type: None,
                body: b"ok".to_vec(),
            })
        }
    }

    fn lifecycle(storage: Arc<MemoryStorage>) -> Arc<CacheLifecycle> {
        Arc::new(CacheLifecycle::new(
            storage,
            Arc::new(Echo),
            ResourceClassifier::default(),
            CacheNamespace::new(StoreId::new("shell", 2), StoreId::new("models", 2)),
            vec![Url::parse("https://app.test/").unwrap()],
        ))
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_despite_open_context() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put("shell-v1", CachedEntry::new("k", vec![], CacheTier::ShellAssets))
            .await
            .unwrap();
        let lc = lifecycle(storage.clone());
        let _context = lc.connect();

        let (handle, _task) = spawn(Arc::clone(&lc));
        lc.subscribe()
            .wait_for(|s| *s == BuildState::Waiting)
            .await
            .unwrap();
        assert!(!lc.is_active());

        let deleted = handle.skip_waiting().await.unwrap();
        assert_eq!(deleted, vec!["shell-v1".to_string()]);
        assert!(lc.is_active());
    }

    #[tokio::test]
    async fn test_model_cache_size_reply() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put("models-v2", CachedEntry::new("w", vec![0; 42], CacheTier::ModelWeights))
            .await
            .unwrap();
        let (handle, _task) = spawn(lifecycle(storage));

        assert_eq!(handle.model_cache_size().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_stopped_worker_reports_error() {
        let (handle, task) = spawn(lifecycle(Arc::new(MemoryStorage::new())));
        task.abort();
        let _ = task.await;

        assert!(matches!(
            handle.model_cache_size().await,
            Err(CacheError::WorkerStopped)
        ));
    }
}
