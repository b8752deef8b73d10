//! Layered key/value store with copy-on-write merging
//!
//! Each layer and the merged view live behind an `ArcSwap`. Readers load the
//! current `Arc` without locking; a reload swaps the layer, rebuilds the merged
//! map and swaps it in one step, so readers see either the old or the new view.

use crate::error::{ConfigServiceError, Result};
use crate::parser::{ConfigMap, KEY_DELIMITER};
use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

struct Layer {
    id: String,
    values: ArcSwap<ConfigMap>,
}

/// Ordered layers merged into one view; later layers win
pub struct LayeredStore {
    layers: Vec<Layer>,
    merged: ArcSwap<ConfigMap>,
    writer: Mutex<()>,
    generation: watch::Sender<u64>,
}

impl LayeredStore {
    /// Store with one empty layer per id, in merge order
    pub fn new<I, S>(layer_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let layers = layer_ids
            .into_iter()
            .map(|id| Layer {
                id: id.into(),
                values: ArcSwap::from_pointee(ConfigMap::new()),
            })
            .collect();
        let (generation, _) = watch::channel(0);
        Self {
            layers,
            merged: ArcSwap::from_pointee(ConfigMap::new()),
            writer: Mutex::new(()),
            generation,
        }
    }

    /// Replace the content of layer `id` and publish a new merged view
    pub fn replace_layer(&self, id: &str, values: ConfigMap) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let values = Arc::new(values);
        let mut found = false;
        for layer in self.layers.iter().filter(|l| l.id == id) {
            layer.values.store(values.clone());
            found = true;
        }
        if !found {
            return Err(ConfigServiceError::Config(format!(
                "Unknown configuration layer '{}'",
                id
            )));
        }

        let mut merged = ConfigMap::new();
        for layer in &self.layers {
            let values = layer.values.load();
            merged.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.merged.store(Arc::new(merged));
        self.generation.send_modify(|g| *g += 1);
        Ok(())
    }

    /// Current content of layer `id`
    pub fn layer(&self, id: &str) -> Option<Arc<ConfigMap>> {
        self.layers
            .iter()
            .find(|l| l.id == id)
            .map(|l| l.values.load_full())
    }

    /// Layer ids in merge order
    pub fn layer_ids(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.id.as_str()).collect()
    }

    /// Merged value for `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.merged.load().get(key).cloned()
    }

    /// The whole merged view
    pub fn snapshot(&self) -> Arc<ConfigMap> {
        self.merged.load_full()
    }

    /// Merged entries equal to `prefix` or below it (`prefix:...`)
    pub fn with_prefix(&self, prefix: &str) -> ConfigMap {
        let merged = self.merged.load();
        if prefix.is_empty() {
            return (**merged).clone();
        }
        let nested = format!("{}{}", prefix, KEY_DELIMITER);
        merged
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| k.as_str() == prefix || k.starts_with(&nested))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of merged views published so far
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Receiver notified on every new merged view
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

impl std::fmt::Debug for LayeredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayeredStore")
            .field("layers", &self.layer_ids())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_later_layer_wins() {
        let store = LayeredStore::new(["file:app.json", "remote:app.json"]);
        store
            .replace_layer("file:app.json", map(&[("X", "1"), ("L", "local")]))
            .unwrap();
        store
            .replace_layer("remote:app.json", map(&[("X", "2")]))
            .unwrap();

        assert_eq!(store.get("X").as_deref(), Some("2"));
        assert_eq!(store.get("L").as_deref(), Some("local"));
    }

    #[test]
    fn test_reload_one_layer_keeps_others() {
        let store = LayeredStore::new(["local", "remote"]);
        store
            .replace_layer("local", map(&[("X", "1"), ("L", "local")]))
            .unwrap();
        store.replace_layer("remote", map(&[("X", "2")])).unwrap();
        store.replace_layer("remote", map(&[("X", "3")])).unwrap();

        assert_eq!(store.get("X").as_deref(), Some("3"));
        assert_eq!(store.get("L").as_deref(), Some("local"));
        assert_eq!(store.layer("local").unwrap().len(), 2);
    }

    #[test]
    fn test_earlier_layer_shows_through_when_later_drops_key() {
        let store = LayeredStore::new(["local", "remote"]);
        store.replace_layer("local", map(&[("X", "1")])).unwrap();
        store.replace_layer("remote", map(&[("X", "2")])).unwrap();
        store.replace_layer("remote", ConfigMap::new()).unwrap();
        assert_eq!(store.get("X").as_deref(), Some("1"));
    }

    #[test]
    fn test_unknown_layer_rejected() {
        let store = LayeredStore::new(["local"]);
        store.replace_layer("local", map(&[("X", "1")])).unwrap();
        assert!(store.replace_layer("other", map(&[("X", "9")])).is_err());
        assert_eq!(store.get("X").as_deref(), Some("1"));
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn test_snapshot_is_stable_across_reloads() {
        let store = LayeredStore::new(["a"]);
        store.replace_layer("a", map(&[("K", "old")])).unwrap();
        let before = store.snapshot();
        store.replace_layer("a", map(&[("K", "new")])).unwrap();

        assert_eq!(before.get("K").map(String::as_str), Some("old"));
        assert_eq!(store.snapshot().get("K").map(String::as_str), Some("new"));
    }

    #[test]
    fn test_with_prefix() {
        let store = LayeredStore::new(["a"]);
        store
            .replace_layer(
                "a",
                map(&[
                    ("Db", "root"),
                    ("Db:Host", "h"),
                    ("Db:Port", "5432"),
                    ("DbExtra", "x"),
                    ("Logging:Level", "info"),
                ]),
            )
            .unwrap();

        let db = store.with_prefix("Db");
        assert_eq!(
            db.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["Db", "Db:Host", "Db:Port"]
        );
        assert_eq!(store.with_prefix("").len(), 5);
        assert!(store.with_prefix("Missing").is_empty());
    }

    #[tokio::test]
    async fn test_generation_notifies_subscribers() {
        let store = LayeredStore::new(["a"]);
        let mut rx = store.subscribe();
        assert_eq!(*rx.borrow(), 0);

        store.replace_layer("a", map(&[("K", "v")])).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_concurrent_readers_see_whole_views() {
        let store = Arc::new(LayeredStore::new(["a", "b"]));
        store
            .replace_layer("a", map(&[("A", "0"), ("B", "0")]))
            .unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1..200 {
                    let v = i.to_string();
                    store
                        .replace_layer("a", map(&[("A", v.as_str()), ("B", v.as_str())]))
                        .unwrap();
                }
            })
        };

        for _ in 0..200 {
            let view = store.snapshot();
            assert_eq!(view.get("A"), view.get("B"));
        }
        writer.join().unwrap();
        assert_eq!(store.get("A").as_deref(), Some("199"));
    }
}
