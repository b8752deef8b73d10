//! Configuration distribution — hash-gated change notifications
//!
//! The service keeps the last published content hash of every resource and
//! publishes a notification only when a resource's hash moves. Each resource
//! has its own slot lock, held from reading the hash to recording it, so
//! concurrent batches touching the same resource cannot lose updates.

pub mod watch;

pub use watch::run_watch_loop;

use crate::error::Result;
use crate::provider::ConfigurationProvider;
use crate::transport::Publisher;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Last published hash of one resource
type HashSlot = Arc<Mutex<Option<String>>>;

/// Result of distributing one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Notification sent
    Published,
    /// Hash recorded without a publisher
    Recorded,
    /// Hash unchanged, nothing sent
    Unchanged,
}

/// Distribution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionStats {
    /// Notifications sent
    pub published: u64,
    /// Changes skipped because the hash was unchanged
    pub unchanged: u64,
    /// Resources that failed to read or publish
    pub failed: u64,
}

/// Watches a provider's resources and notifies subscribers of real changes
pub struct ConfigurationDistributionService {
    provider: Arc<dyn ConfigurationProvider>,
    publisher: Option<Arc<dyn Publisher>>,
    hashes: RwLock<HashMap<String, HashSlot>>,
    published: AtomicU64,
    unchanged: AtomicU64,
    failed: AtomicU64,
}

impl ConfigurationDistributionService {
    /// Create the service. Without a publisher it runs in detection-only
    /// mode: hashes are tracked but nothing is sent.
    pub fn new(
        provider: Arc<dyn ConfigurationProvider>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Self {
        Self {
            provider,
            publisher,
            hashes: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// The content provider
    pub fn provider(&self) -> &Arc<dyn ConfigurationProvider> {
        &self.provider
    }

    /// Whether notifications are sent
    pub fn has_publisher(&self) -> bool {
        self.publisher.is_some()
    }

    /// Publish every resource the provider lists.
    ///
    /// Returns the number of resources distributed. Failing resources are
    /// logged and skipped; only a failure to list resources is an error.
    pub async fn initialize(&self) -> Result<usize> {
        self.provider.initialize().await?;

        if let Some(ref publisher) = self.publisher {
            if let Err(e) = publisher.initialize().await {
                tracing::error!(
                    transport = publisher.name(),
                    error = %e,
                    "Publisher initialization failed, publishing will retry on demand"
                );
            }
        }

        let names = self.provider.list_paths().await?;
        tracing::info!(
            provider = self.provider.name(),
            resources = names.len(),
            "Distributing initial configuration"
        );
        Ok(self.publish_changes(&names).await)
    }

    /// Handle a batch of touched resources. Only resources whose hash
    /// differs from the last published one are sent.
    ///
    /// Returns the number of resources distributed.
    pub async fn on_change(&self, names: &[String]) -> usize {
        self.distribute(names, false).await
    }

    /// Publish `names` regardless of their hashes, refreshing the hash table.
    ///
    /// Returns the number of resources distributed.
    pub async fn publish_changes(&self, names: &[String]) -> usize {
        self.distribute(names, true).await
    }

    /// Hash recorded at the last successful publish of `name`
    pub async fn last_published_hash(&self, name: &str) -> Option<String> {
        let slot = self.existing_slot(name)?;
        let hash = slot.lock().await.clone();
        hash
    }

    /// Names with a recorded hash slot, sorted
    pub fn tracked_resources(&self) -> Vec<String> {
        let hashes = self.hashes.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = hashes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Distribution counters
    pub fn stats(&self) -> DistributionStats {
        DistributionStats {
            published: self.published.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Release the publisher connection
    pub async fn shutdown(&self) {
        if let Some(ref publisher) = self.publisher {
            if let Err(e) = publisher.shutdown().await {
                tracing::warn!(transport = publisher.name(), error = %e, "Publisher shutdown failed");
            }
        }
    }

    async fn distribute(&self, names: &[String], force: bool) -> usize {
        // A name touched twice in one batch is handled once
        let unique: BTreeSet<&str> = names.iter().map(String::as_str).collect();

        let mut distributed = 0;
        for name in unique {
            match self.distribute_one(name, force).await {
                Ok(Outcome::Published) | Ok(Outcome::Recorded) => distributed += 1,
                Ok(Outcome::Unchanged) => {
                    self.unchanged.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(resource = %name, "Content unchanged, skipping publish");
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(resource = %name, error = %e, "Failed to distribute configuration change");
                }
            }
        }
        distributed
    }

    async fn distribute_one(&self, name: &str, force: bool) -> Result<Outcome> {
        let slot = self.slot(name);
        let mut last = slot.lock().await;

        let hash = self.provider.get_hash(name).await?;
        if !force && last.as_deref() == Some(hash.as_str()) {
            return Ok(Outcome::Unchanged);
        }

        let outcome = match self.publisher {
            Some(ref publisher) => {
                publisher.publish(name, name).await?;
                self.published.fetch_add(1, Ordering::Relaxed);
                tracing::info!(resource = %name, hash = %hash, "Published configuration change");
                Outcome::Published
            }
            None => {
                tracing::debug!(resource = %name, hash = %hash, "Change detected, no publisher configured");
                Outcome::Recorded
            }
        };
        *last = Some(hash);
        Ok(outcome)
    }

    fn existing_slot(&self, name: &str) -> Option<HashSlot> {
        self.hashes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn slot(&self, name: &str) -> HashSlot {
        if let Some(slot) = self.existing_slot(name) {
            return slot;
        }
        self.hashes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}
