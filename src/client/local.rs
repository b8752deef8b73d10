//! Local file layers — reading and change watching
//!
//! The parent directory of each watched file is watched non-recursively so
//! editors that replace files (write to temp, then rename) are still seen.

use crate::error::{ConfigServiceError, Result};
use crate::provider::file_system::is_relevant_event;
use bytes::Bytes;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Read a local file; `None` if it does not exist
pub(crate) async fn read_local(path: &Path) -> Result<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(Bytes::from(content))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigServiceError::Io(e)),
    }
}

/// Directory and file name identifying a watched file in events
type WatchKey = (PathBuf, OsString);

fn watch_key(path: &Path) -> Option<WatchKey> {
    let file_name = path.file_name()?.to_os_string();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = std::fs::canonicalize(&parent).unwrap_or(parent);
    Some((parent, file_name))
}

/// Watch `paths` and send the configured path of each changed file.
///
/// The watcher stops when the returned handle is dropped.
pub(crate) fn watch_local_files(
    paths: &[PathBuf],
    changes: mpsc::UnboundedSender<PathBuf>,
) -> Result<RecommendedWatcher> {
    let mut targets: HashMap<WatchKey, PathBuf> = HashMap::new();
    for path in paths {
        let key = watch_key(path).ok_or_else(|| {
            ConfigServiceError::Config(format!("Cannot watch '{}': no file name", path.display()))
        })?;
        targets.insert(key, path.clone());
    }
    let directories: BTreeSet<PathBuf> = targets.keys().map(|(dir, _)| dir.clone()).collect();

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_relevant_event(&event) {
                    return;
                }
                for path in &event.paths {
                    if let Some(configured) = watch_key(path).and_then(|k| targets.get(&k)) {
                        let _ = changes.send(configured.clone());
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Local file watcher error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| ConfigServiceError::Other(format!("Failed to create file watcher: {}", e)))?;

    for dir in &directories {
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ConfigServiceError::Other(format!("Failed to watch {}: {}", dir.display(), e))
            })?;
    }

    tracing::info!(files = paths.len(), "Watching local configuration files");
    Ok(watcher)
}
