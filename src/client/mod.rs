//! Remote configuration client
//!
//! Merges local files and remote resources into one flat key/value view and
//! keeps it live. Layers are ordered local files first, then remote resources,
//! each in the order listed in the settings; later layers win on key collisions.
//!
//! A failed reload never touches the current view: the previous content of the
//! layer is kept and the error is logged.

pub mod local;
pub mod remote;
pub mod store;

pub use remote::RemoteFetcher;
pub use store::LayeredStore;

use crate::config::{LocalFileConfig, RemoteClientSettings, RemoteResourceConfig};
use crate::error::{ConfigServiceError, Result};
use crate::parser::{ConfigMap, ParserRegistry};
use crate::transport::{subscribers_from_config, ConfigurationEventMessage, MessageHandler, Subscriber};
use notify::RecommendedWatcher;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Layered configuration fed by local files and the fetch endpoint
pub struct RemoteConfiguration {
    settings: RemoteClientSettings,
    parsers: ParserRegistry,
    fetcher: RemoteFetcher,
    store: LayeredStore,
    /// Serializes reloads so a slow fetch cannot overwrite a newer one
    reload_lock: Mutex<()>,
    subscribers: Vec<Arc<dyn Subscriber>>,
    watcher: std::sync::Mutex<Option<RecommendedWatcher>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl RemoteConfiguration {
    /// Load every layer once. No subscriptions, no file watching.
    ///
    /// Fails if the settings are invalid or a required layer is missing.
    pub async fn load(settings: RemoteClientSettings, parsers: ParserRegistry) -> Result<Self> {
        Self::build(settings, parsers, Vec::new()).await
    }

    /// Load every layer, then subscribe for change notifications on the
    /// configured transports and watch local files flagged for reload.
    pub async fn connect(
        settings: RemoteClientSettings,
        parsers: ParserRegistry,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let subscribers =
            subscribers_from_config(settings.redis.as_ref(), settings.rabbitmq.as_ref())?;
        Self::connect_with(settings, parsers, subscribers).await
    }

    /// Like [`connect`](Self::connect) with explicitly supplied subscribers
    pub async fn connect_with(
        settings: RemoteClientSettings,
        parsers: ParserRegistry,
        subscribers: Vec<Arc<dyn Subscriber>>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(Self::build(settings, parsers, subscribers).await?);
        config.start_subscriptions().await;
        config.start_local_watch()?;
        Ok(config)
    }

    async fn build(
        settings: RemoteClientSettings,
        parsers: ParserRegistry,
        subscribers: Vec<Arc<dyn Subscriber>>,
    ) -> Result<Self> {
        settings.validate()?;
        settings.validate_parsers(&parsers)?;

        let fetcher = RemoteFetcher::new(
            &settings.service_uri,
            Duration::from_secs(settings.request_timeout_secs),
        )?;
        let layer_ids = settings
            .local_files
            .iter()
            .map(LocalFileConfig::layer_id)
            .chain(settings.resources.iter().map(RemoteResourceConfig::layer_id));
        let store = LayeredStore::new(layer_ids);

        let config = Self {
            settings,
            parsers,
            fetcher,
            store,
            reload_lock: Mutex::new(()),
            subscribers,
            watcher: std::sync::Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        };

        for file in &config.settings.local_files {
            let values = config.load_local_layer(file).await?;
            config.store.replace_layer(&file.layer_id(), values)?;
        }
        for resource in &config.settings.resources {
            let values = config.load_remote_layer(resource, true).await?;
            config.store.replace_layer(&resource.layer_id(), values)?;
        }

        tracing::info!(
            local_files = config.settings.local_files.len(),
            resources = config.settings.resources.len(),
            keys = config.store.snapshot().len(),
            "Remote configuration loaded"
        );
        Ok(config)
    }

    /// Settings this client was built from
    pub fn settings(&self) -> &RemoteClientSettings {
        &self.settings
    }

    /// Merged value for `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// The whole merged view
    pub fn snapshot(&self) -> Arc<ConfigMap> {
        self.store.snapshot()
    }

    /// Merged entries at or below `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> ConfigMap {
        self.store.with_prefix(prefix)
    }

    /// Receiver whose value is bumped after every successful reload
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    /// Content of one layer (`file:<path>` or `remote:<name>`)
    pub fn layer(&self, layer_id: &str) -> Option<Arc<ConfigMap>> {
        self.store.layer(layer_id)
    }

    /// Re-fetch and re-parse remote resource `name`, replacing its layer.
    ///
    /// On failure the previous layer content is kept.
    pub async fn reload_resource(&self, name: &str) -> Result<()> {
        let resource = self
            .settings
            .resources
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| {
                ConfigServiceError::Config(format!("Resource '{}' is not tracked", name))
            })?;

        let _reload = self.reload_lock.lock().await;
        match self.load_remote_layer(resource, false).await {
            Ok(values) => {
                self.store.replace_layer(&resource.layer_id(), values)?;
                tracing::info!(resource = %name, "Remote configuration reloaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(resource = %name, error = %e, "Reload failed, keeping previous configuration");
                Err(e)
            }
        }
    }

    /// Re-read and re-parse the local file at `path`, replacing its layer.
    ///
    /// On failure the previous layer content is kept.
    pub async fn reload_local(&self, path: &Path) -> Result<()> {
        let file = self
            .settings
            .local_files
            .iter()
            .find(|f| f.path == path)
            .ok_or_else(|| {
                ConfigServiceError::Config(format!(
                    "Local file '{}' is not tracked",
                    path.display()
                ))
            })?;

        let _reload = self.reload_lock.lock().await;
        match self.load_local_layer(file).await {
            Ok(values) => {
                self.store.replace_layer(&file.layer_id(), values)?;
                tracing::info!(path = %path.display(), "Local configuration reloaded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Reload failed, keeping previous configuration");
                Err(e)
            }
        }
    }

    /// Stop reload tasks, release subscriber connections and file watchers
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
        }
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.shutdown().await {
                tracing::warn!(transport = subscriber.name(), error = %e, "Subscriber shutdown failed");
            }
        }
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }
        tracing::info!("Remote configuration stopped");
    }

    async fn load_local_layer(&self, file: &LocalFileConfig) -> Result<ConfigMap> {
        let content = match local::read_local(&file.path).await? {
            Some(content) => content,
            None if file.optional => {
                tracing::debug!(path = %file.path.display(), "Optional local file missing, using empty layer");
                return Ok(ConfigMap::new());
            }
            None => {
                return Err(ConfigServiceError::ResourceNotFound(
                    file.path.display().to_string(),
                ))
            }
        };
        self.parse(file.parser_name(), &content)
    }

    /// Fetch and parse one remote layer.
    ///
    /// An optional resource the endpoint reports missing is an empty layer.
    /// An unreachable endpoint only yields an empty layer at `startup`; on
    /// reload the error is returned so the previous layer is kept.
    async fn load_remote_layer(
        &self,
        resource: &RemoteResourceConfig,
        startup: bool,
    ) -> Result<ConfigMap> {
        let content = match self.fetcher.fetch(&resource.name).await {
            Ok(Some(content)) => content,
            Ok(None) if resource.optional => {
                tracing::debug!(resource = %resource.name, "Optional resource missing, using empty layer");
                return Ok(ConfigMap::new());
            }
            Ok(None) => return Err(ConfigServiceError::ResourceNotFound(resource.name.clone())),
            Err(e) if resource.optional && startup => {
                tracing::warn!(resource = %resource.name, error = %e, "Optional resource unavailable, using empty layer");
                return Ok(ConfigMap::new());
            }
            Err(e) => return Err(e),
        };
        self.parse(resource.parser_name(), &content)
    }

    fn parse(&self, parser_name: &str, content: &[u8]) -> Result<ConfigMap> {
        let parser = self.parsers.get(parser_name).ok_or_else(|| {
            ConfigServiceError::Config(format!("Unknown parser '{}'", parser_name))
        })?;
        Ok(parser.parse(content)?)
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
    }

    async fn start_subscriptions(self: &Arc<Self>) {
        let topics: Vec<String> = self
            .settings
            .resources
            .iter()
            .filter(|r| r.reload_on_change)
            .map(|r| r.name.clone())
            .collect();
        if topics.is_empty() || self.subscribers.is_empty() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let handler: MessageHandler = Arc::new(move |msg: ConfigurationEventMessage| {
            let _ = tx.send(msg.resource().to_string());
        });

        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.initialize().await {
                tracing::error!(transport = subscriber.name(), error = %e, "Subscriber initialization failed");
                continue;
            }
            for topic in &topics {
                if let Err(e) = subscriber.subscribe(topic, handler.clone()).await {
                    tracing::error!(
                        transport = subscriber.name(),
                        topic = %topic,
                        error = %e,
                        "Subscribe failed, resource will not reload live"
                    );
                }
            }
        }

        let reload = |config: Arc<Self>, name: String| async move {
            // Errors are logged by reload_resource
            let _ = config.reload_resource(&name).await;
        };
        let task = spawn_reload_loop(Arc::downgrade(self), rx, self.cancel.clone(), reload);
        self.push_task(task);
    }

    fn start_local_watch(self: &Arc<Self>) -> Result<()> {
        let paths: Vec<PathBuf> = self
            .settings
            .local_files
            .iter()
            .filter(|f| f.reload_on_change)
            .map(|f| f.path.clone())
            .collect();
        if paths.is_empty() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = local::watch_local_files(&paths, tx)?;
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(watcher);
        }

        let reload = |config: Arc<Self>, path: PathBuf| async move {
            let _ = config.reload_local(&path).await;
        };
        let task = spawn_reload_loop(Arc::downgrade(self), rx, self.cancel.clone(), reload);
        self.push_task(task);
        Ok(())
    }
}

/// Drain change keys, folding keys already queued into one pass, and reload
/// each once. Ends on cancellation or when the client is dropped.
fn spawn_reload_loop<K, F, Fut>(
    config: Weak<RemoteConfiguration>,
    mut rx: mpsc::UnboundedReceiver<K>,
    cancel: CancellationToken,
    reload: F,
) -> JoinHandle<()>
where
    K: Ord + Send + 'static,
    F: Fn(Arc<RemoteConfiguration>, K) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                key = rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let mut keys = BTreeSet::new();
            keys.insert(first);
            while let Ok(key) = rx.try_recv() {
                keys.insert(key);
            }

            let Some(config) = config.upgrade() else {
                break;
            };
            for key in keys {
                reload(config.clone(), key).await;
            }
        }
    })
}

impl std::fmt::Debug for RemoteConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfiguration")
            .field("service_uri", &self.settings.service_uri)
            .field("store", &self.store)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::tests::MemoryProvider;
    use crate::entrypoint::{start_fetch_endpoint, FetchEndpoint};
    use crate::transport::{InMemoryBroker, Publisher};

    struct Server {
        provider: Arc<MemoryProvider>,
        endpoint: FetchEndpoint,
        cancel: CancellationToken,
    }

    impl Server {
        async fn start(files: &[(&str, &str)]) -> Self {
            let provider = MemoryProvider::with(files);
            let cancel = CancellationToken::new();
            let endpoint = start_fetch_endpoint(
                "127.0.0.1:0".parse().unwrap(),
                provider.clone(),
                cancel.clone(),
            )
            .await
            .unwrap();
            Self {
                provider,
                endpoint,
                cancel,
            }
        }

        fn settings(&self, resources: Vec<RemoteResourceConfig>) -> RemoteClientSettings {
            RemoteClientSettings {
                service_uri: self.endpoint.base_uri(),
                resources,
                ..Default::default()
            }
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn wait_for(config: &RemoteConfiguration, key: &str, value: &str) -> bool {
        let mut changes = config.changes();
        for _ in 0..50 {
            if config.get(key).as_deref() == Some(value) {
                return true;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), changes.changed()).await;
        }
        config.get(key).as_deref() == Some(value)
    }

    #[tokio::test]
    async fn test_remote_layer_overrides_local() {
        let server = Server::start(&[("app.json", r#"{"X":"2"}"#)]).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.json");
        std::fs::write(&local, r#"{"X":"1","L":"local"}"#).unwrap();

        let mut settings = server.settings(vec![RemoteResourceConfig::new("app.json")]);
        settings.local_files = vec![LocalFileConfig::new(&local)];

        let config = RemoteConfiguration::load(settings, ParserRegistry::default())
            .await
            .unwrap();
        assert_eq!(config.get("X").as_deref(), Some("2"));
        assert_eq!(config.get("L").as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_reload_resource_touches_only_its_layer() {
        let server = Server::start(&[("app.json", r#"{"X":"2"}"#)]).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.json");
        std::fs::write(&local, r#"{"X":"1","L":"local"}"#).unwrap();

        let mut settings = server.settings(vec![RemoteResourceConfig::new("app.json")]);
        settings.local_files = vec![LocalFileConfig::new(&local)];
        let config = RemoteConfiguration::load(settings, ParserRegistry::default())
            .await
            .unwrap();
        let generation = *config.changes().borrow();

        server.provider.set("app.json", r#"{"X":"3"}"#);
        config.reload_resource("app.json").await.unwrap();

        assert_eq!(config.get("X").as_deref(), Some("3"));
        assert_eq!(config.get("L").as_deref(), Some("local"));
        assert_eq!(*config.changes().borrow(), generation + 1);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_values() {
        let server = Server::start(&[("app.json", r#"{"X":"2","Y":"y"}"#)]).await;
        let config = RemoteConfiguration::load(
            server.settings(vec![RemoteResourceConfig::new("app.json")]),
            ParserRegistry::default(),
        )
        .await
        .unwrap();
        let before = config.snapshot();

        server.provider.set("app.json", r#"{"X": "#);
        let err = config.reload_resource("app.json").await.unwrap_err();
        assert!(matches!(err, ConfigServiceError::Parse(_)));
        assert_eq!(config.snapshot(), before);

        server.provider.remove("app.json");
        assert!(config.reload_resource("app.json").await.is_err());
        assert_eq!(config.get("X").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_required_remote_missing_is_fatal() {
        let server = Server::start(&[]).await;
        let err = RemoteConfiguration::load(
            server.settings(vec![RemoteResourceConfig::new("app.json")]),
            ParserRegistry::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConfigServiceError::ResourceNotFound(ref n) if n == "app.json"));
    }

    #[tokio::test]
    async fn test_optional_remote_missing_is_empty_layer() {
        let server = Server::start(&[("base.json", r#"{"A":"1"}"#)]).await;
        let mut optional = RemoteResourceConfig::new("extra.json");
        optional.optional = true;
        let config = RemoteConfiguration::load(
            server.settings(vec![RemoteResourceConfig::new("base.json"), optional]),
            ParserRegistry::default(),
        )
        .await
        .unwrap();

        assert_eq!(config.get("A").as_deref(), Some("1"));
        assert!(config.layer("remote:extra.json").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optional_reload_keeps_layer_when_endpoint_fails() {
        let server = Server::start(&[("app.json", r#"{"X":"1"}"#)]).await;
        let mut optional = RemoteResourceConfig::new("app.json");
        optional.optional = true;
        let config = RemoteConfiguration::load(
            server.settings(vec![optional]),
            ParserRegistry::default(),
        )
        .await
        .unwrap();
        let generation = *config.changes().borrow();

        // Endpoint answers 500
        server.provider.fail_reads(true);
        assert!(config.reload_resource("app.json").await.is_err());
        assert_eq!(config.get("X").as_deref(), Some("1"));
        assert_eq!(*config.changes().borrow(), generation);

        // A real 404 empties the optional layer
        server.provider.fail_reads(false);
        server.provider.remove("app.json");
        config.reload_resource("app.json").await.unwrap();
        assert_eq!(config.get("X"), None);
    }

    #[tokio::test]
    async fn test_optional_remote_unreachable_at_startup_is_empty_layer() {
        let server = Server::start(&[("app.json", r#"{"X":"1"}"#)]).await;
        server.provider.fail_reads(true);
        let mut optional = RemoteResourceConfig::new("app.json");
        optional.optional = true;

        let config = RemoteConfiguration::load(
            server.settings(vec![optional]),
            ParserRegistry::default(),
        )
        .await
        .unwrap();
        assert!(config.layer("remote:app.json").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_files_required_and_optional() {
        let server = Server::start(&[]).await;
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");

        let mut settings = server.settings(vec![]);
        settings.local_files = vec![LocalFileConfig::new(&missing)];
        let err = RemoteConfiguration::load(settings.clone(), ParserRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigServiceError::ResourceNotFound(_)));

        settings.local_files[0].optional = true;
        let config = RemoteConfiguration::load(settings, ParserRegistry::default())
            .await
            .unwrap();
        assert!(config.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_parser_selection() {
        let server = Server::start(&[("legacy.cfg", "[Db]\nHost=db1\n")]).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.ini");
        std::fs::write(&local, "; comment\n[Log]\nLevel=debug\n").unwrap();

        let mut resource = RemoteResourceConfig::new("legacy.cfg");
        resource.parser = Some("ini".into());
        let mut settings = server.settings(vec![resource]);
        settings.local_files = vec![LocalFileConfig::new(&local)];

        let config = RemoteConfiguration::load(settings, ParserRegistry::default())
            .await
            .unwrap();
        assert_eq!(config.get("Db:Host").as_deref(), Some("db1"));
        assert_eq!(config.get("Log:Level").as_deref(), Some("debug"));
        assert_eq!(config.keys_with_prefix("Db").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_network() {
        let settings = RemoteClientSettings::default();
        let err = RemoteConfiguration::load(settings, ParserRegistry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigServiceError::Config(_)));

        let mut unknown = RemoteResourceConfig::new("app.json");
        unknown.parser = Some("yaml".into());
        let settings = RemoteClientSettings {
            service_uri: "http://127.0.0.1:1".into(),
            resources: vec![unknown],
            ..Default::default()
        };
        let err = RemoteConfiguration::load(settings, ParserRegistry::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown parser"));
    }

    #[tokio::test]
    async fn test_untracked_reload_rejected() {
        let server = Server::start(&[("app.json", "{}")]).await;
        let config = RemoteConfiguration::load(
            server.settings(vec![RemoteResourceConfig::new("app.json")]),
            ParserRegistry::default(),
        )
        .await
        .unwrap();
        assert!(config.reload_resource("other.json").await.is_err());
        assert!(config.reload_local(Path::new("other.json")).await.is_err());
    }

    #[tokio::test]
    async fn test_notification_triggers_reload() {
        let server = Server::start(&[("app.json", r#"{"X":"1"}"#), ("other.json", r#"{"O":"1"}"#)]).await;
        let broker = Arc::new(InMemoryBroker::new());
        let mut frozen = RemoteResourceConfig::new("other.json");
        frozen.reload_on_change = false;

        let config = RemoteConfiguration::connect_with(
            server.settings(vec![RemoteResourceConfig::new("app.json"), frozen]),
            ParserRegistry::default(),
            vec![broker.clone() as Arc<dyn Subscriber>],
        )
        .await
        .unwrap();
        assert_eq!(broker.subscription_count(), 1);

        server.provider.set("app.json", r#"{"X":"2"}"#);
        server.provider.set("other.json", r#"{"O":"2"}"#);
        broker.publish("app.json", "app.json").await.unwrap();

        assert!(wait_for(&config, "X", "2").await);
        assert_eq!(config.get("O").as_deref(), Some("1"));
        config.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_file_reload() {
        let server = Server::start(&[]).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.json");
        std::fs::write(&local, r#"{"L":"1"}"#).unwrap();

        let mut file = LocalFileConfig::new(&local);
        file.reload_on_change = true;
        let mut settings = server.settings(vec![]);
        settings.local_files = vec![file];

        let config = RemoteConfiguration::connect_with(settings, ParserRegistry::default(), vec![])
            .await
            .unwrap();
        std::fs::write(&local, r#"{"L":"2"}"#).unwrap();
        config.reload_local(&local).await.unwrap();
        assert_eq!(config.get("L").as_deref(), Some("2"));

        std::fs::write(&local, "not json").unwrap();
        assert!(config.reload_local(&local).await.is_err());
        assert_eq!(config.get("L").as_deref(), Some("2"));
        config.shutdown().await;
    }
}
