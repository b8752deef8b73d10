//! Content providers — named configuration resources and their change feed
//!
//! A provider exposes resources as raw bytes, lists the names it knows about
//! and reports changes in batches. The distribution service only talks to the
//! [`ConfigurationProvider`] trait.

pub mod file_system;

pub use file_system::FileSystemProvider;

use crate::error::{ConfigServiceError, Result};
use crate::hash::content_hash;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Source of named configuration resources
#[async_trait]
pub trait ConfigurationProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Prepare the provider before first use
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Send batches of changed resource names to `changes` until `cancel`
    /// fires or the receiver is dropped.
    ///
    /// Once change detection is in place the first batch should name every
    /// resource, so edits made before the watch started are not missed. The
    /// hash gate drops the ones that did not change.
    async fn watch(
        &self,
        changes: mpsc::Sender<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Raw content of `name`
    async fn get_configuration(&self, name: &str) -> Result<Bytes>;

    /// Content hash of `name`
    async fn get_hash(&self, name: &str) -> Result<String> {
        let content = self.get_configuration(name).await?;
        Ok(content_hash(&content))
    }

    /// Every resource name currently available
    async fn list_paths(&self) -> Result<Vec<String>>;
}

/// Check that `name` is a relative, `/`-separated resource name without
/// empty, `.` or `..` segments.
pub fn validate_resource_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(ConfigServiceError::Provider(format!(
            "Invalid resource name '{}': {}",
            name, reason
        )))
    };

    if name.is_empty() {
        return invalid("empty");
    }
    if name.starts_with('/') || name.contains('\\') || name.contains(':') {
        return invalid("must be a relative path");
    }
    if name
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("contains an empty, '.' or '..' segment");
    }
    Ok(())
}
