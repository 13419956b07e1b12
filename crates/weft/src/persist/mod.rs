//! Durable key/value storage for de-attached state payloads.
//!
//! Payloads are plain JSON trees addressed by [`Location`]. A store is only
//! assumed to be crash-consistent per `set`; coalescing and ordering of
//! writes is the [`Saver`]'s job.

mod saver;

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use smol_str::SmolStr;

use crate::error::PersistenceError;
use crate::location::Location;

pub use saver::Saver;

/// Durable store consumed by authoritative replicas.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, location: &Location) -> Result<Option<Value>, PersistenceError>;

    async fn set(&self, location: &Location, payload: &Value) -> Result<(), PersistenceError>;

    /// Remove a payload. Deleting a missing payload is not an error.
    async fn delete(&self, location: &Location) -> Result<(), PersistenceError>;

    async fn list_collections(&self, namespace: &str) -> Result<Vec<SmolStr>, PersistenceError>;

    async fn delete_collection(&self, namespace: &str, collection: &str)
    -> Result<(), PersistenceError>;
}

/// In-memory store, for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    payloads: DashMap<Location, Value>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent `set` fail until switched back off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, location: &Location) -> Result<Option<Value>, PersistenceError> {
        Ok(self.payloads.get(location).map(|entry| entry.value().clone()))
    }

    async fn set(&self, location: &Location, payload: &Value) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Write {
                key: location.id(),
                source: "memory store is failing writes".into(),
            });
        }
        self.payloads.insert(location.clone(), payload.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, location: &Location) -> Result<(), PersistenceError> {
        self.payloads.remove(location);
        Ok(())
    }

    async fn list_collections(&self, namespace: &str) -> Result<Vec<SmolStr>, PersistenceError> {
        let collections: BTreeSet<SmolStr> = self
            .payloads
            .iter()
            .filter(|entry| entry.key().namespace == namespace)
            .map(|entry| entry.key().collection.clone())
            .collect();
        Ok(collections.into_iter().collect())
    }

    async fn delete_collection(
        &self,
        namespace: &str,
        collection: &str,
    ) -> Result<(), PersistenceError> {
        self.payloads
            .retain(|location, _| !(location.namespace == namespace && location.collection == collection));
        Ok(())
    }
}

/// JSON files under `root/namespace/collection/key.json`.
///
/// Writes go to a temporary sibling first and are renamed into place, so
/// a reader never sees a partially written payload.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, location: &Location) -> Result<PathBuf, PersistenceError> {
        Ok(self
            .root
            .join(component(&location.namespace)?)
            .join(component(&location.collection)?)
            .join(format!("{}.json", component(&location.key)?)))
    }
}

/// A single path segment that stays inside its parent directory.
fn component(part: &str) -> Result<&str, PersistenceError> {
    let invalid = part.is_empty()
        || part == "."
        || part == ".."
        || part.contains(['/', '\\', '\0']);
    if invalid {
        return Err(PersistenceError::InvalidKey {
            part: part.to_string(),
        });
    }
    Ok(part)
}

fn read_error(key: String, e: std::io::Error) -> PersistenceError {
    PersistenceError::Read {
        key,
        source: Box::new(e),
    }
}

fn write_error(key: String, e: std::io::Error) -> PersistenceError {
    PersistenceError::Write {
        key,
        source: Box::new(e),
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, location: &Location) -> Result<Option<Value>, PersistenceError> {
        let file = match tokio::fs::read_to_string(self.path(location)?).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(read_error(location.id(), e)),
        };
        let payload = serde_json::from_str(&file).map_err(|source| PersistenceError::Serialize {
            key: location.id(),
            source,
        })?;
        Ok(Some(payload))
    }

    async fn set(&self, location: &Location, payload: &Value) -> Result<(), PersistenceError> {
        let path = self.path(location)?;
        let file = serde_json::to_vec(payload).map_err(|source| PersistenceError::Serialize {
            key: location.id(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(location.id(), e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, file)
            .await
            .map_err(|e| write_error(location.id(), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| write_error(location.id(), e))?;
        Ok(())
    }

    async fn delete(&self, location: &Location) -> Result<(), PersistenceError> {
        match tokio::fs::remove_file(self.path(location)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_error(location.id(), e)),
        }
    }

    async fn list_collections(&self, namespace: &str) -> Result<Vec<SmolStr>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(self.root.join(component(namespace)?)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_error(namespace.to_string(), e)),
        };
        let mut collections = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| read_error(namespace.to_string(), e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                collections.insert(SmolStr::new(name));
            }
        }
        Ok(collections.into_iter().collect())
    }

    async fn delete_collection(
        &self,
        namespace: &str,
        collection: &str,
    ) -> Result<(), PersistenceError> {
        let dir = self.root.join(component(namespace)?).join(component(collection)?);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_error(format!("{namespace}/{collection}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_collections() {
        let store = MemoryStore::new();
        store
            .set(&Location::new("app", "todos", "a"), &json!({"n": 1}))
            .await
            .unwrap();
        store
            .set(&Location::new("app", "notes", "b"), &json!({}))
            .await
            .unwrap();
        store
            .set(&Location::new("other", "x", "c"), &json!({}))
            .await
            .unwrap();

        assert_eq!(
            store.list_collections("app").await.unwrap(),
            vec![SmolStr::new("notes"), SmolStr::new("todos")]
        );

        store.delete_collection("app", "todos").await.unwrap();
        assert!(store.get(&Location::new("app", "todos", "a")).await.unwrap().is_none());
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_failing_writes() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let err = store
            .set(&Location::new("app", "todos", "a"), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let location = Location::new("app", "todos", "list");

        assert!(store.get(&location).await.unwrap().is_none());
        let payload = json!({"count": 5, "items": [{"@": "Todo", ":version": 1, "text": "a"}]});
        store.set(&location, &payload).await.unwrap();
        assert_eq!(store.get(&location).await.unwrap(), Some(payload));
        assert!(dir.path().join("app/todos/list.json").exists());

        assert_eq!(
            store.list_collections("app").await.unwrap(),
            vec![SmolStr::new("todos")]
        );

        store.delete(&location).await.unwrap();
        store.delete(&location).await.unwrap();
        assert!(store.get(&location).await.unwrap().is_none());

        store.delete_collection("app", "todos").await.unwrap();
        assert!(store.list_collections("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_escaping_components() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let store = FileStore::new(&root);

        let escaping = Location::new("app", "todos", "../../../escaped");
        let err = store.set(&escaping, &json!({})).await.unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidKey { .. }));
        assert!(!dir.path().join("escaped.json").exists());

        for location in [
            Location::new("..", "todos", "a"),
            Location::new("app", "a\\b", "a"),
            Location::new("app", "", "a"),
        ] {
            assert!(store.get(&location).await.is_err());
            assert!(store.delete(&location).await.is_err());
        }
        assert!(store.delete_collection("app", "..").await.is_err());
        assert!(store.list_collections("..").await.is_err());
    }
}
