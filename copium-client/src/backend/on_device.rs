//! On-device model backend
//!
//! The model runtime is an injected collaborator. Loading runs in the
//! background: wait (bounded) for the runtime, download every weight file
//! through the cache router, then hand the bytes to the runtime. The tier is
//! ready exactly when a classifier has been built.

use super::{Backend, RawOutput};
use crate::cache::{CacheRouter, ResponseSource};
use crate::error::{BackendError, CacheError, FetchError, ModelLoadError, RuntimeError};
use crate::fetch::ResourceRequest;
use crate::progress::{self, DownloadHandle, DownloadProgress, ProgressSender, ProgressStream};
use crate::types::BackendTier;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Probability for one label index, in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelProbability {
    pub index: usize,
    pub probability: f64,
}

/// Raw runtime output entry, e.g. `{label: "LABEL_2", score: 0.81}`
#[derive(Debug, Clone, PartialEq)]
pub struct RankedLabel {
    pub label: String,
    pub score: f64,
}

impl RankedLabel {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }

    fn index(&self) -> Option<usize> {
        self.label.strip_prefix("LABEL_")?.parse().ok()
    }
}

/// A loaded text classification model
#[async_trait]
pub trait TextClassifier: Send + Sync {
    /// Scores for every label
    async fn classify(&self, text: &str) -> Result<Vec<RankedLabel>, RuntimeError>;
}

/// A downloaded weight file
#[derive(Debug, Clone)]
pub struct ModelFile {
    pub url: String,
    pub bytes: Vec<u8>,
}

/// Builds classifiers from downloaded weights
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    async fn load(
        &self,
        model_id: &str,
        files: Vec<ModelFile>,
    ) -> Result<Arc<dyn TextClassifier>, RuntimeError>;
}

/// Source of the model runtime, which may become available late
pub trait RuntimeProvider: Send + Sync {
    fn runtime(&self) -> Option<Arc<dyn ModelRuntime>>;
}

/// No runtime on this host; the on-device tier never becomes ready
pub struct NoRuntime;

impl RuntimeProvider for NoRuntime {
    fn runtime(&self) -> Option<Arc<dyn ModelRuntime>> {
        None
    }
}

/// A runtime that is available from the start
pub struct StaticRuntime(pub Arc<dyn ModelRuntime>);

impl RuntimeProvider for StaticRuntime {
    fn runtime(&self) -> Option<Arc<dyn ModelRuntime>> {
        Some(Arc::clone(&self.0))
    }
}

/// Load state of the on-device model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelState {
    NotLoaded,
    Loading { percent: u8 },
    Loaded,
    Failed { reason: String },
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoaded => f.write_str("not loaded"),
            Self::Loading { percent } => write!(f, "loading ({percent}%)"),
            Self::Loaded => f.write_str("loaded"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

pub struct OnDeviceModel {
    model_id: String,
    files: Vec<Url>,
    router: Arc<CacheRouter>,
    provider: Arc<dyn RuntimeProvider>,
    poll_attempts: u32,
    poll_interval: Duration,
    state: watch::Sender<ModelState>,
    classifier: RwLock<Option<Arc<dyn TextClassifier>>>,
}

impl OnDeviceModel {
    pub fn new(
        model_id: impl Into<String>,
        files: Vec<Url>,
        router: Arc<CacheRouter>,
        provider: Arc<dyn RuntimeProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ModelState::NotLoaded);
        Self {
            model_id: model_id.into(),
            files,
            router,
            provider,
            poll_attempts: 50,
            poll_interval: Duration::from_millis(100),
            state,
            classifier: RwLock::new(None),
        }
    }

    /// Bound the wait for the runtime to `attempts` polls `interval` apart
    pub fn with_runtime_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// Start the background load
    ///
    /// Returns `None` when a load is already running or has completed.
    /// A failed load may be started again.
    pub fn start_loading(self: &Arc<Self>) -> Option<(ProgressStream, DownloadHandle)> {
        let started = self.state.send_if_modified(|state| match state {
            ModelState::Loading { .. } | ModelState::Loaded => false,
            _ => {
                *state = ModelState::Loading { percent: 0 };
                true
            }
        });
        if !started {
            return None;
        }

        let (sender, stream, handle) = progress::channel();
        let model = Arc::clone(self);
        tokio::spawn(async move {
            match model.load(&sender).await {
                Ok(classifier) => {
                    *model.classifier.write() = Some(classifier);
                    model.state.send_replace(ModelState::Loaded);
                    info!(model = %model.model_id, "On-device model ready");
                }
                Err(e) => {
                    warn!(model = %model.model_id, error = %e, "On-device model load failed");
                    model.state.send_replace(ModelState::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        });

        Some((stream, handle))
    }

    async fn load(
        &self,
        progress: &ProgressSender,
    ) -> Result<Arc<dyn TextClassifier>, ModelLoadError> {
        let runtime = self.wait_for_runtime(progress).await?;

        let total = self.files.len();
        let mut files = Vec::with_capacity(total);
        for (i, url) in self.files.iter().enumerate() {
            if progress.is_cancelled() {
                return Err(ModelLoadError::Cancelled);
            }
            files.push(self.download(url, progress).await?);

            let percent = ((i + 1) * 100 / total.max(1)) as u8;
            self.state.send_replace(ModelState::Loading { percent });
        }

        debug!(model = %self.model_id, files = files.len(), "Weights available, building classifier");
        Ok(runtime.load(&self.model_id, files).await?)
    }

    async fn download(
        &self,
        url: &Url,
        progress: &ProgressSender,
    ) -> Result<ModelFile, ModelLoadError> {
        let file = url.to_string();
        let request = ResourceRequest::get(url.clone());

        let routed = match self.router.handle_with_progress(&request, Some(progress)).await {
            Ok(routed) => routed,
            Err(CacheError::Network(FetchError::Cancelled)) => return Err(ModelLoadError::Cancelled),
            Err(e) => {
                progress.send(DownloadProgress::Failed {
                    file,
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        if !routed.response.is_success() {
            let status = routed.response.status;
            progress.send(DownloadProgress::Failed {
                file: file.clone(),
                reason: format!("HTTP {status}"),
            });
            return Err(ModelLoadError::BadStatus { file, status });
        }

        // Cache hits already reported completion
        if routed.source != ResponseSource::Cache {
            progress.send(DownloadProgress::Done {
                file: file.clone(),
                bytes: routed.response.body.len() as u64,
                from_cache: false,
            });
        }

        Ok(ModelFile {
            url: file,
            bytes: routed.response.body,
        })
    }

    async fn wait_for_runtime(
        &self,
        progress: &ProgressSender,
    ) -> Result<Arc<dyn ModelRuntime>, ModelLoadError> {
        for attempt in 0..self.poll_attempts {
            if let Some(runtime) = self.provider.runtime() {
                debug!(attempt, "Model runtime available");
                return Ok(runtime);
            }
            if progress.is_cancelled() {
                return Err(ModelLoadError::Cancelled);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(ModelLoadError::RuntimeUnavailable {
            attempts: self.poll_attempts,
        })
    }
}

#[async_trait]
impl Backend for OnDeviceModel {
    fn tier(&self) -> BackendTier {
        BackendTier::OnDeviceModel
    }

    fn is_ready(&self) -> bool {
        self.classifier.read().is_some()
    }

    async fn infer(&self, text: &str) -> Result<RawOutput, BackendError> {
        let classifier = self
            .classifier
            .read()
            .clone()
            .ok_or(BackendError::Unavailable(BackendTier::OnDeviceModel))?;

        let ranked = classifier
            .classify(text)
            .await
            .map_err(|e| BackendError::failure(BackendTier::OnDeviceModel, e))?;

        let probabilities = ranked
            .iter()
            .map(|entry| {
                entry
                    .index()
                    .map(|index| LabelProbability {
                        index,
                        probability: entry.score,
                    })
                    .ok_or_else(|| {
                        BackendError::malformed(format!("unrecognized model label {:?}", entry.label))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RawOutput::OnDevice(probabilities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLifecycle, CacheNamespace, MemoryStorage, ResourceClassifier, StoreId};
    use crate::fetch::{Fetch, FetchedResponse};
    use futures::StreamExt;
    use parking_lot::Mutex;

    struct Weights;

    #[async_trait]
    impl Fetch for Weights {
        async fn fetch(
            &self,
            request: &ResourceRequest,
            _progress: Option<&ProgressSender>,
        ) -> Result<FetchedResponse, FetchError> {
            let status = if request.url.path().ends_with("gone.bin") { 404 } else { 200 };
            Ok(FetchedResponse {
                url: request.cache_key(),
                status,
                content_type: None,
                body: vec![1, 2, 3],
            })
        }
    }

    struct FixedClassifier(Vec<RankedLabel>);

    #[async_trait]
    impl TextClassifier for FixedClassifier {
        async fn classify(&self, _text: &str) -> Result<Vec<RankedLabel>, RuntimeError> {
            Ok(self.0.clone())
        }
    }

    /// Records the files it was handed
    #[derive(Default)]
    struct RecordingRuntime {
        loaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelRuntime for RecordingRuntime {
        async fn load(
            &self,
            _model_id: &str,
            files: Vec<ModelFile>,
        ) -> Result<Arc<dyn TextClassifier>, RuntimeError> {
            self.loaded.lock().extend(files.into_iter().map(|f| f.url));
            Ok(Arc::new(FixedClassifier(vec![
                RankedLabel::new("LABEL_2", 0.7),
                RankedLabel::new("LABEL_0", 0.2),
                RankedLabel::new("LABEL_1", 0.06),
                RankedLabel::new("LABEL_3", 0.04),
            ])))
        }
    }

    fn router() -> Arc<CacheRouter> {
        let fetcher: Arc<dyn Fetch> = Arc::new(Weights);
        let lifecycle = Arc::new(CacheLifecycle::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&fetcher),
            ResourceClassifier::default(),
            CacheNamespace::new(StoreId::new("shell", 1), StoreId::new("models", 1)),
            Vec::new(),
        ));
        Arc::new(CacheRouter::new(
            ResourceClassifier::default(),
            lifecycle,
            fetcher,
            Url::parse("https://app.test/index.html").unwrap(),
        ))
    }

    fn model(files: &[&str], provider: Arc<dyn RuntimeProvider>) -> Arc<OnDeviceModel> {
        let files = files.iter().map(|f| Url::parse(f).unwrap()).collect();
        Arc::new(
            OnDeviceModel::new("test/model", files, router(), provider)
                .with_runtime_polling(3, Duration::from_millis(1)),
        )
    }

    async fn finished(model: &OnDeviceModel) -> ModelState {
        let mut state = model.subscribe();
        let done = state
            .wait_for(|s| matches!(s, ModelState::Loaded | ModelState::Failed { .. }))
            .await
            .unwrap()
            .clone();
        done
    }

    #[tokio::test]
    async fn test_load_downloads_weights_then_becomes_ready() {
        let runtime = Arc::new(RecordingRuntime::default());
        let model = model(
            &["https://hf.co/a.json", "https://hf.co/b.onnx"],
            Arc::new(StaticRuntime(runtime.clone())),
        );
        assert!(!model.is_ready());

        let (stream, _handle) = model.start_loading().unwrap();
        assert_eq!(finished(&model).await, ModelState::Loaded);
        assert!(model.is_ready());
        assert_eq!(runtime.loaded.lock().len(), 2);

        let events: Vec<_> = stream.collect().await;
        let done = events
            .iter()
            .filter(|e| matches!(e, DownloadProgress::Done { .. }))
            .count();
        assert_eq!(done, 2);
    }

    #[tokio::test]
    async fn test_start_loading_is_idempotent() {
        let model = model(
            &["https://hf.co/a.json"],
            Arc::new(StaticRuntime(Arc::new(RecordingRuntime::default()))),
        );
        assert!(model.start_loading().is_some());
        assert!(model.start_loading().is_none());
        finished(&model).await;
        assert!(model.start_loading().is_none());
    }

    #[tokio::test]
    async fn test_missing_runtime_fails_after_bounded_polling() {
        let model = model(&["https://hf.co/a.json"], Arc::new(NoRuntime));
        model.start_loading().unwrap();

        let state = finished(&model).await;
        assert!(matches!(state, ModelState::Failed { ref reason } if reason.contains("3 attempts")));
        assert!(!model.is_ready());
    }

    #[tokio::test]
    async fn test_bad_weight_status_fails_load() {
        let model = model(
            &["https://hf.co/gone.bin"],
            Arc::new(StaticRuntime(Arc::new(RecordingRuntime::default()))),
        );
        model.start_loading().unwrap();
        assert!(matches!(finished(&model).await, ModelState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_infer_parses_label_indices() {
        let model = model(
            &["https://hf.co/a.json"],
            Arc::new(StaticRuntime(Arc::new(RecordingRuntime::default()))),
        );
        model.start_loading().unwrap();
        finished(&model).await;

        let RawOutput::OnDevice(probs) = model.infer("hello").await.unwrap() else {
            panic!("expected on-device output");
        };
        assert_eq!(probs[0], LabelProbability { index: 2, probability: 0.7 });
        assert_eq!(probs.len(), 4);
    }

    #[tokio::test]
    async fn test_infer_before_load_is_unavailable() {
        let model = model(&[], Arc::new(NoRuntime));
        assert_eq!(
            model.infer("hello").await,
            Err(BackendError::Unavailable(BackendTier::OnDeviceModel))
        );
    }

    #[test]
    fn test_ranked_label_index() {
        assert_eq!(RankedLabel::new("LABEL_3", 0.1).index(), Some(3));
        assert_eq!(RankedLabel::new("copium", 0.1).index(), None);
    }
}
