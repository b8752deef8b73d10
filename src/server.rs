//! Config server — hosting-side coordinator
//!
//! Ties together the content provider, the publisher, the distribution
//! service, its watch loop and the fetch endpoint into a single manageable unit.

use crate::config::ServiceConfig;
use crate::distribution::{run_watch_loop, ConfigurationDistributionService};
use crate::entrypoint::{start_fetch_endpoint, FetchEndpoint};
use crate::error::{ConfigServiceError, Result};
use crate::provider::{ConfigurationProvider, FileSystemProvider};
use crate::transport::{publisher_from_config, Publisher};
use crate::ServiceState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Server status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Current server state
    pub state: ServiceState,
    /// Seconds since the server was created
    pub uptime_secs: u64,
    /// Resources with a recorded hash
    pub resources: usize,
    /// Notifications sent
    pub published: u64,
    /// Changes skipped because content was unchanged
    pub unchanged: u64,
    /// Resources that failed to distribute
    pub failed: u64,
}

struct Running {
    endpoint: FetchEndpoint,
    watch: JoinHandle<Result<()>>,
}

/// The configuration server
pub struct ConfigServer {
    config: ServiceConfig,
    service: Arc<ConfigurationDistributionService>,
    state: RwLock<ServiceState>,
    start_time: Instant,
    cancel: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl ConfigServer {
    /// Create a server from configuration: file-system provider plus the
    /// configured Redis/RabbitMQ publishers. Nothing connects yet.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;

        let file = config.provider.file.as_ref().ok_or_else(|| {
            ConfigServiceError::Config("A provider must be configured (provider.file)".to_string())
        })?;
        let provider: Arc<dyn ConfigurationProvider> = Arc::new(FileSystemProvider::new(file));
        let publisher = publisher_from_config(config.redis.as_ref(), config.rabbitmq.as_ref())?;

        Ok(Self::with_parts(config, provider, publisher))
    }

    /// Create a server around an explicit provider and publisher
    pub fn with_parts(
        config: ServiceConfig,
        provider: Arc<dyn ConfigurationProvider>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Self {
        if publisher.is_none() {
            tracing::warn!("No publisher configured, running in detection-only mode");
        }
        Self {
            config,
            service: Arc::new(ConfigurationDistributionService::new(provider, publisher)),
            state: RwLock::new(ServiceState::Created),
            start_time: Instant::now(),
            cancel: CancellationToken::new(),
            running: Mutex::new(None),
        }
    }

    /// Distribute every resource, bind the fetch endpoint and start watching
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ConfigServiceError::Other("Server already started".to_string()));
        }
        self.set_state(ServiceState::Starting);

        let addr = self.config.listen_addr()?;
        let distributed = match self.service.initialize().await {
            Ok(n) => n,
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };
        tracing::info!(distributed, "Initial configuration distributed");

        let endpoint =
            match start_fetch_endpoint(addr, self.service.provider().clone(), self.cancel.child_token()).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    self.set_state(ServiceState::Stopped);
                    return Err(e);
                }
            };
        let watch = tokio::spawn(run_watch_loop(self.service.clone(), self.cancel.child_token()));

        *running = Some(Running { endpoint, watch });
        self.set_state(ServiceState::Running);
        tracing::info!("Config server is running");
        Ok(())
    }

    /// Stop watching and serving; in-flight publishes complete first
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.set_state(ServiceState::Stopping);
        tracing::info!("Config server shutting down");

        self.cancel.cancel();
        match running.watch.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Watch loop ended with error"),
            Err(e) => tracing::error!(error = %e, "Watch loop task failed"),
        }
        running.endpoint.join().await;
        self.service.shutdown().await;

        self.set_state(ServiceState::Stopped);
        tracing::info!("Config server stopped");
    }

    /// Wait for a shutdown signal (Ctrl+C), then shut down
    pub async fn wait_for_shutdown(&self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        self.shutdown().await;
    }

    /// Current state
    pub fn state(&self) -> ServiceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Bound fetch endpoint address, once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.endpoint.local_addr())
    }

    /// The distribution service
    pub fn service(&self) -> &Arc<ConfigurationDistributionService> {
        &self.service
    }

    /// Configuration the server was created from
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Status snapshot
    pub fn status(&self) -> ServerStatus {
        let stats = self.service.stats();
        ServerStatus {
            state: self.state(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            resources: self.service.tracked_resources().len(),
            published: stats.published,
            unchanged: stats.unchanged,
            failed: stats.failed,
        }
    }

    fn set_state(&self, new_state: ServiceState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(from = %*state, to = %new_state, "State transition");
        *state = new_state;
    }
}
