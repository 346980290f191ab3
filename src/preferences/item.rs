use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::{encode, load_value, PreferenceBackend, Resettable};

#[derive(Clone)]
struct Cached<T> {
    value: T,
    persisted: bool,
}

/// A typed, persisted, defaultable configuration cell.
///
/// The value is read from the backend on first access and cached; later reads never
/// touch the backend again. Writes update the cache and persist best-effort.
pub struct PreferenceItem<T> {
    key: String,
    default: T,
    cache: Mutex<Option<Cached<T>>>,
    backend: Arc<dyn PreferenceBackend>,
}

impl<T> PreferenceItem<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(key: String, default: T, backend: Arc<dyn PreferenceBackend>) -> Self {
        Self {
            key,
            default,
            cache: Mutex::new(None),
            backend,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub async fn get(&self) -> T {
        self.load().await.value
    }

    /// Whether a value is stored for this key, as opposed to running on the default.
    pub async fn is_persisted(&self) -> bool {
        self.load().await.persisted
    }

    /// Stores `value` unless it equals the current one. Returns whether it changed.
    pub async fn set(&self, value: T) -> bool {
        self.set_with(value, false).await
    }

    /// Writes the current value to the backend even if nothing changed.
    pub async fn force_save(&self) {
        let value = self.get().await;
        self.set_with(value, true).await;
    }

    pub async fn set_with(&self, value: T, force: bool) -> bool {
        let current = self.load().await;
        if current.value == value && !force {
            return false;
        }

        let persisted = match encode(&self.key, &value) {
            Ok(json) => match self.backend.save(&self.key, &json).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to save {}: {}", self.key, e);
                    current.persisted
                }
            },
            Err(e) => {
                warn!("Failed to save {}: {}", self.key, e);
                current.persisted
            }
        };

        *self.cache.lock() = Some(Cached { value, persisted });
        true
    }

    async fn load(&self) -> Cached<T> {
        let snapshot = self.cache.lock().clone();
        if let Some(cached) = snapshot {
            return cached;
        }

        let cached = match load_value::<T>(self.backend.as_ref(), &self.key).await {
            Some(value) => Cached { value, persisted: true },
            None => Cached {
                value: self.default.clone(),
                persisted: false,
            },
        };

        let mut cache = self.cache.lock();
        // a concurrent set may have landed while we were loading
        cache.get_or_insert(cached).clone()
    }
}

impl<T> Resettable for PreferenceItem<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn restore_default(&self) {
        *self.cache.lock() = Some(Cached {
            value: self.default.clone(),
            persisted: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{MemoryBackend, PreferenceStore};

    fn setup() -> (Arc<MemoryBackend>, PreferenceStore) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), PreferenceStore::new(backend))
    }

    #[tokio::test]
    async fn test_reads_are_cached_after_first_access() {
        let (backend, store) = setup();
        backend.insert_raw("ZipBackup.Threads", "{\"value\":6}");
        let item = store.item("Threads", 4i64);

        assert_eq!(item.get().await, 6);
        let loads = backend.load_count();
        assert_eq!(item.get().await, 6);
        assert_eq!(item.get().await, 6);
        assert_eq!(backend.load_count(), loads);
    }

    #[tokio::test]
    async fn test_equal_value_skips_persist_unless_forced() {
        let (backend, store) = setup();
        let item = store.item("LogToConsole", true);

        assert!(!item.set(true).await);
        assert_eq!(backend.save_count(), 0);
        assert!(!item.is_persisted().await);

        item.force_save().await;
        assert_eq!(backend.save_count(), 1);
        assert!(item.is_persisted().await);

        assert!(item.set(false).await);
        assert_eq!(backend.save_count(), 2);
        assert_eq!(backend.raw("ZipBackup.LogToConsole").as_deref(), Some("{\"value\":false}"));
    }

    #[tokio::test]
    async fn test_corrupt_value_reverts_to_default() {
        let (backend, store) = setup();
        backend.insert_raw("ZipBackup.Mode", "{\"value\":\"Rar\"}");
        let item = store.item("Mode", crate::backup::ToolKind::SevenZip);

        assert_eq!(item.get().await, crate::backup::ToolKind::SevenZip);
        assert!(!item.is_persisted().await);
        assert!(backend.raw("ZipBackup.Mode").is_none());
    }

    #[tokio::test]
    async fn test_failed_save_still_updates_cache() {
        let (backend, store) = setup();
        let item = store.item("CustomSaveLocation", String::new());
        backend.fail_saves(true);

        assert!(item.set("/backups".to_string()).await);
        assert_eq!(item.get().await, "/backups");
        assert!(!item.is_persisted().await);
        assert!(backend.raw("ZipBackup.CustomSaveLocation").is_none());
    }

    #[tokio::test]
    async fn test_empty_collection_differs_from_never_configured() {
        let (backend, store) = setup();
        let defaults = vec!["/Assets".to_string(), "/ProjectSettings".to_string()];
        let folders = store.item("Folders", defaults.clone());

        assert_eq!(folders.get().await, defaults);
        assert!(!folders.is_persisted().await);

        folders.set(Vec::new()).await;
        let reopened = PreferenceStore::new(backend).item("Folders", defaults);
        assert!(reopened.get().await.is_empty());
        assert!(reopened.is_persisted().await);
    }
}
