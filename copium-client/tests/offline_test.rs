//! Tests for offline operation: shell install, model weight caching and
//! restart without network

mod common;

#[cfg(test)]
mod tests {
    use super::common::{
        FakeRuntime, SlowShellFetcher, client_with_model, create_mock_server, mock_probe,
        mock_shell, mock_weights, offline_client_with_model, test_config,
    };
    use copium_client::backend::StaticRuntime;
    use copium_client::cache::{
        BuildState, CacheStorage, DiskStorage, MemoryStorage, ResponseSource,
    };
    use copium_client::fetch::ResourceRequest;
    use copium_client::{BackendTier, CopiumClient, DownloadProgress, Label, ModelState};
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    async fn wait_loaded(client: &CopiumClient) -> ModelState {
        let mut states = client.watch_model();
        let state = states
            .wait_for(|s| matches!(s, ModelState::Loaded | ModelState::Failed { .. }))
            .await
            .unwrap()
            .clone();
        state
    }

    #[tokio::test]
    async fn test_build_installs_and_activates() {
        let mut server = create_mock_server().await;
        mock_shell(&mut server).await;
        let storage = Arc::new(MemoryStorage::new());

        let client = client_with_model(test_config(&server.url()), storage.clone()).await;
        assert_eq!(client.wait_for_build().await, BuildState::Active);

        let keys = storage.keys("copiummeter-v4").await.unwrap();
        assert_eq!(keys.len(), 7);
        assert!(keys.iter().any(|k| k.ends_with("/app/index.html")));
        assert!(!storage.has_store("copiummeter-models-v4").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_install_never_activates() {
        let server = create_mock_server().await;
        let client = client_with_model(
            test_config(&server.url()),
            Arc::new(MemoryStorage::new()),
        )
        .await;

        assert_eq!(client.wait_for_build().await, BuildState::Failed);
        assert!(!client.lifecycle().is_active());
    }

    #[tokio::test]
    async fn test_model_weights_cached_after_first_load() {
        let mut server = create_mock_server().await;
        mock_shell(&mut server).await;
        let weights = mock_weights(&mut server, 1).await;
        let storage = Arc::new(MemoryStorage::new());

        let client = client_with_model(test_config(&server.url()), storage.clone()).await;
        client.wait_for_build().await;

        let (progress, _handle) = client.load_model().unwrap();
        assert_eq!(wait_loaded(&client).await, ModelState::Loaded);

        let events: Vec<DownloadProgress> = progress.collect().await;
        assert!(events
            .iter()
            .any(|e| matches!(e, DownloadProgress::Done { from_cache: false, .. })));

        assert_eq!(client.control().model_cache_size().await.unwrap(), 512);

        // A second client on the same storage loads from cache only
        let second = client_with_model(test_config(&server.url()), storage).await;
        second.wait_for_build().await;
        second.load_model().unwrap();
        assert_eq!(wait_loaded(&second).await, ModelState::Loaded);
        weights.assert_async().await;

        let result = second.analyze("so excited for monday").await.unwrap();
        assert_eq!(result.backend, BackendTier::OnDeviceModel);
        assert_eq!(result.label, Label::Sarcastic);
    }

    #[tokio::test]
    async fn test_model_loaded_during_install_is_cached() {
        let mut server = create_mock_server().await;
        mock_shell(&mut server).await;
        mock_weights(&mut server, 1).await;
        let storage = Arc::new(MemoryStorage::new());

        let client = CopiumClient::builder(test_config(&server.url()))
            .storage(storage.clone())
            .fetcher(Arc::new(SlowShellFetcher::new(Duration::from_millis(200))))
            .runtime(Arc::new(StaticRuntime(Arc::new(FakeRuntime))))
            .build()
            .await
            .unwrap();

        // Started right away, while shell assets are still installing
        client.load_model().unwrap();
        assert_eq!(wait_loaded(&client).await, ModelState::Loaded);
        assert_eq!(client.wait_for_build().await, BuildState::Active);

        assert_eq!(storage.keys("copiummeter-models-v4").await.unwrap().len(), 2);
        assert_eq!(client.control().model_cache_size().await.unwrap(), 512);
    }

    #[tokio::test]
    async fn test_restart_fully_offline_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = create_mock_server().await;
        mock_shell(&mut server).await;
        mock_weights(&mut server, 1).await;
        let config = test_config(&server.url());

        {
            let storage = Arc::new(DiskStorage::open(dir.path()).await.unwrap());
            let client = client_with_model(config.clone(), storage).await;
            assert_eq!(client.wait_for_build().await, BuildState::Active);
            client.load_model().unwrap();
            assert_eq!(wait_loaded(&client).await, ModelState::Loaded);
        }

        // Same build restarted with no network at all
        let storage = Arc::new(DiskStorage::open(dir.path()).await.unwrap());
        let offline = offline_client_with_model(config.clone(), storage).await;

        assert_eq!(offline.wait_for_build().await, BuildState::Active);
        assert!(!offline.refresh_connectivity().await);

        let navigation = ResourceRequest::navigate(
            Url::parse(&format!("{}/app/deep/link", server.url())).unwrap(),
        );
        let routed = offline.router().handle(&navigation).await.unwrap();
        assert_eq!(routed.source, ResponseSource::OfflineShell);

        offline.load_model().unwrap();
        assert_eq!(wait_loaded(&offline).await, ModelState::Loaded);

        let result = offline.analyze("at least it could be worse").await.unwrap();
        assert_eq!(result.backend, BackendTier::OnDeviceModel);
        assert_eq!(result.label, Label::Sarcastic);
        assert_eq!(offline.status().summary(), "Offline - Local model ready");
    }

    #[tokio::test]
    async fn test_offline_first_run_uses_heuristic() {
        let offline = offline_client_with_model(
            test_config("http://app.invalid"),
            Arc::new(MemoryStorage::new()),
        )
        .await;

        assert_eq!(offline.wait_for_build().await, BuildState::Failed);
        offline.refresh_connectivity().await;
        offline.load_model().unwrap();
        assert!(matches!(wait_loaded(&offline).await, ModelState::Failed { .. }));

        let result = offline.analyze("at least it could be worse").await.unwrap();
        assert_eq!(result.backend, BackendTier::HeuristicScorer);
        assert_eq!(result.label, Label::Copium);
    }

    #[tokio::test]
    async fn test_shell_upgrade_keeps_model_weights() {
        let mut server = create_mock_server().await;
        mock_shell(&mut server).await;
        mock_weights(&mut server, 1).await;
        let storage = Arc::new(MemoryStorage::new());

        let v4 = client_with_model(test_config(&server.url()), storage.clone()).await;
        v4.wait_for_build().await;
        v4.load_model().unwrap();
        wait_loaded(&v4).await;

        let v5 = client_with_model(
            test_config(&server.url()).with_versions(5, 4),
            storage.clone(),
        )
        .await;
        assert_eq!(v5.wait_for_build().await, BuildState::Active);

        assert_eq!(
            storage.store_names().await.unwrap(),
            vec!["copiummeter-models-v4", "copiummeter-v5"]
        );
        assert_eq!(v5.control().model_cache_size().await.unwrap(), 512);
    }

    #[tokio::test]
    async fn test_offline_status_and_probe() {
        let mut server = create_mock_server().await;
        mock_shell(&mut server).await;
        mock_probe(&mut server, 500).await;

        let client = CopiumClient::new(test_config(&server.url())).await.unwrap();
        assert_eq!(client.status().summary(), "Initializing...");

        client.refresh_connectivity().await;
        let status = client.status();
        assert_eq!(status.summary(), "Offline - No model cached");
        assert_eq!(status.ready_tiers, vec![BackendTier::HeuristicScorer]);
    }
}
