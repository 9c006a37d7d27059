use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;

use super::{ObjectStore, ShimError};

/// In-memory object store.
///
/// Useful for tests and dry runs. It records every `put` call so callers can
/// assert that existing objects were never written again, and can be told to
/// fail writes for specific keys.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    put_log: RwLock<Vec<String>>,
    failing_keys: RwLock<HashSet<String>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given keys with empty payloads.
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let objects = keys.into_iter().map(|k| (k.into(), Vec::new())).collect();
        Self {
            objects: RwLock::new(objects),
            ..Self::default()
        }
    }

    /// Make every future `put` of `key` fail.
    pub fn fail_puts_for(&self, key: impl Into<String>) -> Result<(), ShimError> {
        self.failing_keys
            .write()
            .map_err(|_| ShimError::LockPoisoned)?
            .insert(key.into());
        Ok(())
    }

    /// Keys passed to `put`, in call order, including rejected calls.
    pub fn put_calls(&self) -> Vec<String> {
        self.put_log
            .read()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, ShimError> {
        let objects = self.objects.read().map_err(|_| ShimError::LockPoisoned)?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, ShimError> {
        let objects = self.objects.read().map_err(|_| ShimError::LockPoisoned)?;
        Ok(objects.contains_key(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<(), ShimError> {
        self.put_log
            .write()
            .map_err(|_| ShimError::LockPoisoned)?
            .push(key.to_string());

        let failing = self
            .failing_keys
            .read()
            .map_err(|_| ShimError::LockPoisoned)?
            .contains(key);
        if failing {
            return Err(ShimError::Other(format!("injected write failure for {}", key)));
        }

        let mut objects = self.objects.write().map_err(|_| ShimError::LockPoisoned)?;
        if !overwrite && objects.contains_key(key) {
            return Err(ShimError::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_list_by_prefix() {
        let store = InMemoryObjectStore::new();
        store.put("raw/a.txt", b"a".to_vec(), false).await.unwrap();
        store.put("other/b.txt", b"b".to_vec(), false).await.unwrap();

        let listed = store.list("raw/").await.unwrap();

        assert_eq!(listed.into_iter().collect::<Vec<_>>(), vec!["raw/a.txt"]);
        assert!(store.exists("other/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_if_absent_keeps_existing_object() {
        let store = InMemoryObjectStore::new();
        store.put("raw/a.txt", b"first".to_vec(), false).await.unwrap();

        let result = store.put("raw/a.txt", b"second".to_vec(), false).await;

        assert!(matches!(result, Err(ShimError::AlreadyExists(_))));
        assert_eq!(store.get("raw/a.txt").unwrap(), b"first".to_vec());
        assert_eq!(store.put_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_object() {
        let store = InMemoryObjectStore::with_keys(["raw/a.txt"]);
        store.put("raw/a.txt", b"new".to_vec(), true).await.unwrap();
        assert_eq!(store.get("raw/a.txt").unwrap(), b"new".to_vec());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryObjectStore::new();
        store.fail_puts_for("raw/bad.txt").unwrap();

        assert!(store.put("raw/bad.txt", vec![], false).await.is_err());
        assert!(!store.exists("raw/bad.txt").await.unwrap());
    }
}
