//! File-system provider — every matching file below a root directory
//!
//! Uses the `notify` crate for cross-platform file system events
//! (inotify on Linux, kqueue on macOS, ReadDirectoryChanges on Windows).
//! Events already queued when a batch is taken are folded into that batch;
//! there is no timed debounce.

use super::{validate_resource_name, ConfigurationProvider};
use crate::config::FileProviderConfig;
use crate::error::{ConfigServiceError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Provider serving files below a root directory
pub struct FileSystemProvider {
    root: PathBuf,
    extensions: Vec<String>,
    recursive: bool,
}

impl FileSystemProvider {
    /// Create a provider from its settings
    pub fn new(config: &FileProviderConfig) -> Self {
        Self {
            root: config.root.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            recursive: config.include_subdirectories,
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn matches_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Map a path below `base` to its resource name, if it is one
    fn resource_name(&self, base: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(base).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => segments.push(segment.to_str()?),
                _ => return None,
            }
        }
        if segments.is_empty() || (!self.recursive && segments.len() > 1) {
            return None;
        }
        if !self.matches_extension(relative) {
            return None;
        }
        Some(segments.join("/"))
    }

    /// Resolve a resource name to a path below the root
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_resource_name(name)?;
        if !self.recursive && name.contains('/') {
            return Err(ConfigServiceError::ResourceNotFound(name.to_string()));
        }
        let path = self.root.join(name);
        if !self.matches_extension(&path) {
            return Err(ConfigServiceError::ResourceNotFound(name.to_string()));
        }
        Ok(path)
    }

    /// Names for the paths of one relevant event
    fn collect_event(&self, roots: &[PathBuf], event: &Event, names: &mut BTreeSet<String>) {
        if !is_relevant_event(event) {
            return;
        }
        for path in &event.paths {
            if path.is_dir() {
                continue;
            }
            if let Some(name) = roots.iter().find_map(|root| self.resource_name(root, path)) {
                names.insert(name);
            }
        }
    }
}

#[async_trait]
impl ConfigurationProvider for FileSystemProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn initialize(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            ConfigServiceError::Provider(format!(
                "Cannot access provider root {}: {}",
                self.root.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(ConfigServiceError::Provider(format!(
                "Provider root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn watch(
        &self,
        changes: mpsc::Sender<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| {
                let _ = event_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigServiceError::Provider(format!("Failed to create file watcher: {}", e)))?;

        let mode = if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&self.root, mode).map_err(|e| {
            ConfigServiceError::Provider(format!("Failed to watch {}: {}", self.root.display(), e))
        })?;

        // Events may report canonical paths (e.g. /private/var on macOS)
        let mut roots = vec![self.root.clone()];
        if let Ok(canonical) = tokio::fs::canonicalize(&self.root).await {
            if canonical != self.root {
                roots.push(canonical);
            }
        }

        tracing::info!(root = %self.root.display(), recursive = self.recursive, "Watching provider root");

        // Catch up on edits made between the initial listing and now
        match self.list_paths().await {
            Ok(names) if !names.is_empty() => {
                if changes.send(names).await.is_err() {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Catch-up scan failed"),
        }

        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut names = BTreeSet::new();
            let mut pending = Some(first);
            while let Some(event) = pending.take() {
                match event {
                    Ok(event) => self.collect_event(&roots, &event, &mut names),
                    Err(e) => tracing::warn!(error = %e, "File watcher error"),
                }
                pending = event_rx.try_recv().ok();
            }

            if names.is_empty() {
                continue;
            }
            tracing::debug!(count = names.len(), "File changes detected");
            if changes.send(names.into_iter().collect()).await.is_err() {
                break;
            }
        }

        drop(watcher);
        tracing::info!(root = %self.root.display(), "Stopped watching provider root");
        Ok(())
    }

    async fn get_configuration(&self, name: &str) -> Result<Bytes> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigServiceError::ResourceNotFound(name.to_string()))
            }
            Err(e) if path.is_dir() => {
                tracing::debug!(resource = %name, error = %e, "Resource is a directory");
                Err(ConfigServiceError::ResourceNotFound(name.to_string()))
            }
            Err(e) => Err(ConfigServiceError::Provider(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn list_paths(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                ConfigServiceError::Provider(format!("Failed to list {}: {}", dir.display(), e))
            })?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    if self.recursive {
                        pending.push(path);
                    }
                } else if let Some(name) = self.resource_name(&self.root, &path) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Check if a file system event can change resource content
pub(crate) fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}
