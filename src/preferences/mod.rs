//! Typed, persisted preferences.
//!
//! Values are stored under the `ZipBackup.` prefix as a small JSON wrapper
//! (`{"value": ...}`) so that any serde type round-trips. A stored value that can't be
//! decoded is dropped and the default used instead.

pub mod item;
pub mod settings;

pub use item::PreferenceItem;
pub use settings::{Settings, SettingsPatch, SettingsSnapshot};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ZipBackupError};

pub const KEY_PREFIX: &str = "ZipBackup.";

/// Where preference values live between runs.
#[async_trait]
pub trait PreferenceBackend: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;
    async fn save(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Serialize)]
struct WrapperRef<'a, T> {
    value: &'a T,
}

#[derive(Deserialize)]
struct Wrapper<T> {
    value: T,
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<String> {
    serde_json::to_string(&WrapperRef { value }).map_err(|e| ZipBackupError::Preference {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(json: &str) -> std::result::Result<T, serde_json::Error> {
    serde_json::from_str::<Wrapper<T>>(json).map(|w| w.value)
}

/// Loads and decodes `key`. Corrupt or unreadable values come back as `None`; corrupt
/// ones are also deleted so the next read is clean.
pub(crate) async fn load_value<T: DeserializeOwned>(backend: &dyn PreferenceBackend, key: &str) -> Option<T> {
    let json = match backend.load(key).await {
        Ok(Some(json)) => json,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read preference item \"{}\", using default value: {}", key, e);
            return None;
        }
    };
    match decode(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to load preference item \"{}\", using default value: {}", key, e);
            if let Err(e) = backend.delete(key).await {
                warn!("Failed to drop corrupt preference \"{}\": {}", key, e);
            }
            None
        }
    }
}

/// Anything that takes part in the "use defaults" broadcast.
pub(crate) trait Resettable: Send + Sync {
    fn key(&self) -> &str;
    fn restore_default(&self);
}

struct StoreInner {
    backend: Arc<dyn PreferenceBackend>,
    items: Mutex<Vec<Weak<dyn Resettable>>>,
}

/// Entry point to the preferences. Cheap to clone; clones share registrations.
#[derive(Clone)]
pub struct PreferenceStore {
    inner: Arc<StoreInner>,
}

impl PreferenceStore {
    pub fn new(backend: Arc<dyn PreferenceBackend>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                items: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    pub fn full_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    pub fn backend(&self) -> Arc<dyn PreferenceBackend> {
        self.inner.backend.clone()
    }

    /// Creates a typed item and registers it for [`reset_all`](Self::reset_all).
    pub fn item<T>(&self, key: &str, default: T) -> Arc<PreferenceItem<T>>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let item = Arc::new(PreferenceItem::new(Self::full_key(key), default, self.inner.backend.clone()));
        let weak: Weak<dyn Resettable> = Arc::downgrade(&(item.clone() as Arc<dyn Resettable>));
        self.inner.items.lock().push(weak);
        item
    }

    pub fn registered(&self) -> usize {
        self.inner.items.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Reads `key` straight from the backend, falling back to `default`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        load_value(self.inner.backend.as_ref(), &Self::full_key(key))
            .await
            .unwrap_or(default)
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let key = Self::full_key(key);
        let json = encode(&key, value)?;
        self.inner.backend.save(&key, &json).await
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        let full = Self::full_key(key);
        self.inner.backend.delete(&full).await?;
        for item in self.live_items() {
            if item.key() == full {
                item.restore_default();
            }
        }
        Ok(())
    }

    /// Deletes every registered key and puts each live item back on its default.
    pub async fn reset_all(&self) -> usize {
        let items = self.live_items();
        for item in &items {
            if let Err(e) = self.inner.backend.delete(item.key()).await {
                warn!("Failed to delete preference \"{}\": {}", item.key(), e);
            }
            item.restore_default();
        }
        debug!("Reset {} preference items", items.len());
        items.len()
    }

    /// Forgets all registrations.
    pub fn teardown(&self) {
        self.inner.items.lock().clear();
    }

    fn live_items(&self) -> Vec<Arc<dyn Resettable>> {
        let mut items = self.inner.items.lock();
        items.retain(|w| w.strong_count() > 0);
        items.iter().filter_map(|w| w.upgrade()).collect()
    }
}

/// Process-local backend, used for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PreferenceBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ZipBackupError::Io(std::io::Error::other("backend is read-only")));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<MemoryBackend>, PreferenceStore) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), PreferenceStore::new(backend))
    }

    #[tokio::test]
    async fn test_values_are_wrapped_under_prefix() {
        let (backend, store) = store();
        store.set("PackLevel", &3).await.unwrap();
        assert_eq!(backend.raw("ZipBackup.PackLevel").as_deref(), Some("{\"value\":3}"));
        assert_eq!(store.get("PackLevel", 1).await, 3);
        assert_eq!(store.get("Missing", 7).await, 7);
    }

    #[tokio::test]
    async fn test_corrupt_value_falls_back_and_is_removed() {
        let (backend, store) = store();
        backend.insert_raw("ZipBackup.Threads", "not json");
        assert_eq!(store.get("Threads", 8).await, 8);
        assert!(backend.raw("ZipBackup.Threads").is_none());
    }

    #[tokio::test]
    async fn test_reset_all_without_items() {
        let (_, store) = store();
        assert_eq!(store.reset_all().await, 0);
    }

    #[tokio::test]
    async fn test_reset_all_restores_every_default() {
        let (backend, store) = store();
        let level = store.item("PackLevel", 1i64);
        let enabled = store.item("AutoBackup", false);
        let folders = store.item("Folders", vec!["/Assets".to_string()]);

        level.set(9).await;
        enabled.set(true).await;
        folders.set(Vec::new()).await;
        store.set("LastBackup", &"kept").await.unwrap();

        assert_eq!(store.reset_all().await, 3);
        assert_eq!(level.get().await, 1);
        assert!(!enabled.get().await);
        assert_eq!(folders.get().await, vec!["/Assets".to_string()]);
        assert!(backend.raw("ZipBackup.PackLevel").is_none());
        assert!(backend.raw("ZipBackup.LastBackup").is_some());
    }

    #[tokio::test]
    async fn test_dropped_items_leave_the_broadcast() {
        let (_, store) = store();
        let kept = store.item("A", 1u8);
        {
            let _gone = store.item("B", 2u8);
            assert_eq!(store.registered(), 2);
        }
        assert_eq!(store.registered(), 1);
        assert_eq!(store.reset_all().await, 1);
        assert_eq!(kept.get().await, 1);
    }

    #[tokio::test]
    async fn test_reset_single_key() {
        let (backend, store) = store();
        let item = store.item("EarlyOut", 98i64);
        item.set(50).await;
        store.reset("EarlyOut").await.unwrap();
        assert_eq!(item.get().await, 98);
        assert!(backend.raw("ZipBackup.EarlyOut").is_none());
    }

    #[tokio::test]
    async fn test_teardown_clears_registrations() {
        let (_, store) = store();
        let _item = store.item("A", 1u8);
        store.teardown();
        assert_eq!(store.registered(), 0);
    }
}
