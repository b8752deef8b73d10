//! Watch loop — provider change batches into the distribution service
//!
//! Each batch is handled on its own task so a slow publish does not hold up
//! the next batch. On cancellation the provider watch is stopped, every batch
//! it sends before returning is still handled, and in-flight publishes run to
//! completion.

use super::ConfigurationDistributionService;
use crate::error::{ConfigServiceError, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pending change batches buffered between provider and service
const CHANGE_QUEUE_CAPACITY: usize = 64;

/// Run until `cancel` fires or the provider stops watching.
///
/// Returns the provider's watch error, if it failed.
pub async fn run_watch_loop(
    service: Arc<ConfigurationDistributionService>,
    cancel: CancellationToken,
) -> Result<()> {
    let (changes_tx, mut changes_rx) = mpsc::channel(CHANGE_QUEUE_CAPACITY);
    let watch_cancel = cancel.child_token();

    let watcher = {
        let provider = service.provider().clone();
        let watch_cancel = watch_cancel.clone();
        tokio::spawn(async move { provider.watch(changes_tx, watch_cancel).await })
    };

    tracing::info!(provider = service.provider().name(), "Watch loop started");

    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = changes_rx.recv() => match batch {
                Some(batch) => spawn_batch(&mut in_flight, &service, batch),
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }
        }
    }

    // The channel closes once the provider watch returns and drops its sender
    watch_cancel.cancel();
    while let Some(batch) = changes_rx.recv().await {
        spawn_batch(&mut in_flight, &service, batch);
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }

    let result = match watcher.await {
        Ok(result) => result,
        Err(e) => Err(ConfigServiceError::Other(format!("Watch task failed: {}", e))),
    };
    match result {
        Ok(()) => tracing::info!("Watch loop stopped"),
        Err(ref e) => tracing::error!(error = %e, "Provider watch failed"),
    }
    result
}

fn spawn_batch(
    in_flight: &mut JoinSet<usize>,
    service: &Arc<ConfigurationDistributionService>,
    batch: Vec<String>,
) {
    let service = service.clone();
    in_flight.spawn(async move { service.on_change(&batch).await });
}

fn log_join(joined: std::result::Result<usize, tokio::task::JoinError>) {
    match joined {
        Ok(distributed) => tracing::debug!(distributed, "Change batch handled"),
        Err(e) => tracing::error!(error = %e, "Change batch task failed"),
    }
}
