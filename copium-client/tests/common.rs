//! Common test utilities

use async_trait::async_trait;
use copium_client::backend::on_device::ModelFile;
use copium_client::backend::{ModelRuntime, RankedLabel, StaticRuntime, TextClassifier};
use copium_client::cache::{CacheStorage, HostRule};
use copium_client::error::{FetchError, RuntimeError};
use copium_client::fetch::{Fetch, FetchedResponse, HttpFetcher, ResourceRequest};
use copium_client::progress::ProgressSender;
use copium_client::{CopiumClient, CopiumConfig};
use mockito::{Matcher, Mock, Server, ServerGuard};
use std::sync::Arc;
use std::time::Duration;

/// Route client logs to the test harness, filtered by `RUST_LOG`
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Create a mock server standing in for the app origin, the remote API and
/// the weight host
#[allow(dead_code)] // Used by other test modules
pub async fn create_mock_server() -> ServerGuard {
    Server::new_async().await
}

/// Client configuration pointing every collaborator at `base_url`
///
/// Shell assets live under `/app/`, weights under `/models/`, the remote
/// endpoint is `/api/predict` and its probe `/`.
#[allow(dead_code)]
pub fn test_config(base_url: &str) -> CopiumConfig {
    let mut config = CopiumConfig::default()
        .with_endpoint(format!("{base_url}/api/predict"))
        .with_origin(format!("{base_url}/app/"))
        .with_timeout(Duration::from_secs(2))
        .with_model_files([
            format!("{base_url}/models/config.json"),
            format!("{base_url}/models/model_quantized.onnx"),
        ]);
    config.cache.precache = Vec::new();
    config.cache.model_hosts = vec![HostRule::host("127.0.0.1").with_path("/models/")];
    config.model.runtime_poll_attempts = 3;
    config.model.runtime_poll_interval_ms = 1;
    config
}

/// Serve every shell asset
#[allow(dead_code)]
pub async fn mock_shell(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", Matcher::Regex(r"^/app/".to_string()))
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<!doctype html><title>CopiumMeter</title>")
        .create_async()
        .await
}

/// Serve both weight files, expecting `hits` downloads of each
#[allow(dead_code)]
pub async fn mock_weights(server: &mut ServerGuard, hits: usize) -> Mock {
    server
        .mock("GET", Matcher::Regex(r"^/models/".to_string()))
        .with_status(200)
        .with_body(vec![0u8; 256])
        .expect(hits * 2)
        .create_async()
        .await
}

#[allow(dead_code)]
pub async fn mock_probe(server: &mut ServerGuard, status: usize) -> Mock {
    server
        .mock("GET", "/")
        .with_status(status)
        .create_async()
        .await
}

/// Setup a client against a mock server with memory storage
#[allow(dead_code)]
pub async fn setup_test_client() -> (CopiumClient, ServerGuard) {
    let mut server = create_mock_server().await;
    mock_shell(&mut server).await;
    init_tracing();
    let client = CopiumClient::new(test_config(&server.url())).await.unwrap();
    (client, server)
}

/// Build a client over `storage` with the fake model runtime
#[allow(dead_code)]
pub async fn client_with_model(
    config: CopiumConfig,
    storage: Arc<dyn CacheStorage>,
) -> CopiumClient {
    init_tracing();
    CopiumClient::builder(config)
        .storage(storage)
        .runtime(Arc::new(StaticRuntime(Arc::new(FakeRuntime))))
        .build()
        .await
        .unwrap()
}

/// Build a client whose every network request fails
#[allow(dead_code)]
pub async fn offline_client_with_model(
    config: CopiumConfig,
    storage: Arc<dyn CacheStorage>,
) -> CopiumClient {
    init_tracing();
    CopiumClient::builder(config)
        .storage(storage)
        .fetcher(Arc::new(OfflineFetcher))
        .runtime(Arc::new(StaticRuntime(Arc::new(FakeRuntime))))
        .build()
        .await
        .unwrap()
}

/// Fetcher for a host with no network
#[allow(dead_code)]
pub struct OfflineFetcher;

#[async_trait]
impl Fetch for OfflineFetcher {
    async fn fetch(
        &self,
        _request: &ResourceRequest,
        _progress: Option<&ProgressSender>,
    ) -> Result<FetchedResponse, FetchError> {
        Err(FetchError::Timeout(Duration::from_secs(2)))
    }
}

/// HTTP fetcher that holds back shell assets so install stays in progress
#[allow(dead_code)]
pub struct SlowShellFetcher {
    inner: HttpFetcher,
    delay: Duration,
}

impl SlowShellFetcher {
    #[allow(dead_code)]
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: HttpFetcher::new(Duration::from_secs(2)).unwrap(),
            delay,
        }
    }
}

#[async_trait]
impl Fetch for SlowShellFetcher {
    async fn fetch(
        &self,
        request: &ResourceRequest,
        progress: Option<&ProgressSender>,
    ) -> Result<FetchedResponse, FetchError> {
        if request.url.path().starts_with("/app/") {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.fetch(request, progress).await
    }
}

/// Runtime whose model always answers sarcastic
#[allow(dead_code)]
pub struct FakeRuntime;

#[allow(dead_code)]
struct SarcasticModel;

#[async_trait]
impl TextClassifier for SarcasticModel {
    async fn classify(&self, _text: &str) -> Result<Vec<RankedLabel>, RuntimeError> {
        Ok(vec![
            RankedLabel::new("LABEL_1", 0.88),
            RankedLabel::new("LABEL_0", 0.07),
            RankedLabel::new("LABEL_3", 0.03),
            RankedLabel::new("LABEL_2", 0.02),
        ])
    }
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    async fn load(
        &self,
        _model_id: &str,
        files: Vec<ModelFile>,
    ) -> Result<Arc<dyn TextClassifier>, RuntimeError> {
        if files.iter().any(|f| f.bytes.is_empty()) {
            return Err(RuntimeError("empty weight file".to_string()));
        }
        Ok(Arc::new(SarcasticModel))
    }
}
