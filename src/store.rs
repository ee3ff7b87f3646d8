//! Keyed JSON stores for records and schedules
//!
//! The file store keeps the whole collection in one JSON array and
//! rewrites it atomically (temp, fsync, rename) on every mutation, so a
//! state transition is exactly one durable write.

use std::collections::BTreeMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::fs_util;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store file {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Items addressable by id
pub trait Keyed {
    fn key(&self) -> Uuid;
}

/// Storage backend for a keyed collection
pub trait Store<T>: Send + Sync {
    fn list(&self) -> StoreResult<Vec<T>>;

    fn get(&self, id: Uuid) -> StoreResult<Option<T>>;

    /// Insert or replace by key
    fn put(&self, item: T) -> StoreResult<()>;

    /// Returns whether the item existed
    fn remove(&self, id: Uuid) -> StoreResult<bool>;

    /// Modify the item with `id` in place while holding the write lock.
    ///
    /// `apply` returns whether it changed anything; unchanged items are
    /// not written. `None` when no such item exists, in which case
    /// nothing is inserted.
    fn update(&self, id: Uuid, apply: &mut dyn FnMut(&mut T) -> bool) -> StoreResult<Option<T>>;
}

/// Collection persisted as a JSON array in one file
pub struct JsonFileStore<T> {
    path: PathBuf,
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T>
where
    T: Keyed + Clone + Serialize + DeserializeOwned,
{
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        };
        // Surface corruption at startup, not on first use
        store.read_all()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> StoreResult<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn write_all(&self, items: &[T]) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(items).map_err(|e| StoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs_util::atomic_write(&self.path, &json).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl<T> Store<T> for JsonFileStore<T>
where
    T: Keyed + Clone + Serialize + DeserializeOwned,
{
    fn list(&self) -> StoreResult<Vec<T>> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.read_all()
    }

    fn get(&self, id: Uuid) -> StoreResult<Option<T>> {
        Ok(self.list()?.into_iter().find(|item| item.key() == id))
    }

    fn put(&self, item: T) -> StoreResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut items = self.read_all()?;
        match items.iter_mut().find(|existing| existing.key() == item.key()) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
        self.write_all(&items)
    }

    fn remove(&self, id: Uuid) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut items = self.read_all()?;
        let before = items.len();
        items.retain(|item| item.key() != id);
        if items.len() == before {
            return Ok(false);
        }
        self.write_all(&items)?;
        Ok(true)
    }

    fn update(&self, id: Uuid, apply: &mut dyn FnMut(&mut T) -> bool) -> StoreResult<Option<T>> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut items = self.read_all()?;
        let Some(item) = items.iter_mut().find(|existing| existing.key() == id) else {
            return Ok(None);
        };
        let changed = apply(item);
        let updated = item.clone();
        if changed {
            self.write_all(&items)?;
        }
        Ok(Some(updated))
    }
}

/// In-memory store for tests
pub struct MemoryStore<T> {
    items: RwLock<BTreeMap<Uuid, T>>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> Store<T> for MemoryStore<T>
where
    T: Keyed + Clone + Send + Sync,
{
    fn list(&self) -> StoreResult<Vec<T>> {
        let items = self.items.read().map_err(|_| StoreError::Poisoned)?;
        Ok(items.values().cloned().collect())
    }

    fn get(&self, id: Uuid) -> StoreResult<Option<T>> {
        let items = self.items.read().map_err(|_| StoreError::Poisoned)?;
        Ok(items.get(&id).cloned())
    }

    fn put(&self, item: T) -> StoreResult<()> {
        let mut items = self.items.write().map_err(|_| StoreError::Poisoned)?;
        items.insert(item.key(), item);
        Ok(())
    }

    fn remove(&self, id: Uuid) -> StoreResult<bool> {
        let mut items = self.items.write().map_err(|_| StoreError::Poisoned)?;
        Ok(items.remove(&id).is_some())
    }

    fn update(&self, id: Uuid, apply: &mut dyn FnMut(&mut T) -> bool) -> StoreResult<Option<T>> {
        let mut items = self.items.write().map_err(|_| StoreError::Poisoned)?;
        Ok(items.get_mut(&id).map(|item| {
            apply(item);
            item.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: Uuid,
        value: String,
    }

    impl Keyed for Item {
        fn key(&self) -> Uuid {
            self.id
        }
    }

    fn item(value: &str) -> Item {
        Item {
            id: Uuid::new_v4(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data").join("items.json");

        let a = item("a");
        {
            let store = JsonFileStore::<Item>::open(&path).unwrap();
            store.put(a.clone()).unwrap();
            store.put(item("b")).unwrap();
        }

        let store = JsonFileStore::<Item>::open(&path).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.get(a.id).unwrap(), Some(a.clone()));

        let mut changed = a.clone();
        changed.value = "a2".to_string();
        store.put(changed.clone()).unwrap();
        assert_eq!(store.get(a.id).unwrap(), Some(changed));
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(store.remove(a.id).unwrap());
        assert!(!store.remove(a.id).unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("items.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            JsonFileStore::<Item>::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_update_never_resurrects_removed_items() {
        let temp = TempDir::new().unwrap();
        let file = JsonFileStore::<Item>::open(temp.path().join("items.json")).unwrap();
        let memory = MemoryStore::<Item>::new();
        let stores: [&dyn Store<Item>; 2] = [&file, &memory];

        for store in stores {
            let a = item("a");
            store.put(a.clone()).unwrap();

            let updated = store
                .update(a.id, &mut |i| {
                    i.value = "a2".to_string();
                    true
                })
                .unwrap();
            assert_eq!(updated.unwrap().value, "a2");
            assert_eq!(store.get(a.id).unwrap().unwrap().value, "a2");

            store.remove(a.id).unwrap();
            let mut called = false;
            let missing = store
                .update(a.id, &mut |_| {
                    called = true;
                    true
                })
                .unwrap();
            assert!(missing.is_none());
            assert!(!called);
            assert!(store.list().unwrap().is_empty());
        }
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::<Item>::new();
        let a = item("a");
        store.put(a.clone()).unwrap();
        assert_eq!(store.get(a.id).unwrap(), Some(a.clone()));
        assert!(store.remove(a.id).unwrap());
        assert!(store.list().unwrap().is_empty());
    }
}
