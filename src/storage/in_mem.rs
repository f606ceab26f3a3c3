//! Object store with all data in memory.
//!
//! Used for the `memory` storage backend and throughout the tests,
//! which is why it counts calls and can be told to fail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::ObjectStore;
use crate::errors::StorageError;

#[derive(Debug, Default)]
struct Container {
    exists: bool,
    blobs: BTreeMap<String, Vec<u8>>,
}

/// An object store with all blobs in memory.
#[derive(Debug, Default)]
pub struct InMemStore {
    container: Mutex<Container>,
    /// Fail `put`s of names ending with this.
    fail_puts_ending_with: Mutex<Option<String>>,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn container(&self) -> Result<MutexGuard<'_, Container>, StorageError> {
        self.container
            .lock()
            .map_err(|_| StorageError::Unavailable("in-memory store poisoned".to_owned()))
    }

    /// Make every later `put` of a name ending in `suffix` fail, or
    /// stop failing with `None`.
    pub fn fail_puts_ending_with(&self, suffix: Option<&str>) {
        if let Ok(mut fail) = self.fail_puts_ending_with.lock() {
            *fail = suffix.map(str::to_owned);
        }
    }

    /// Number of `get` calls so far.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of `list` calls so far, including through `list_dirs`.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemStore {
    async fn ensure_container(&self) -> Result<(), StorageError> {
        self.container()?.exists = true;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.container()?.blobs.get(name).cloned())
    }

    async fn put(&self, name: &str, body: &[u8]) -> Result<(), StorageError> {
        let failing = self
            .fail_puts_ending_with
            .lock()
            .map(|fail| fail.as_deref().map_or(false, |suffix| name.ends_with(suffix)))
            .unwrap_or(false);
        if failing {
            return Err(StorageError::Unavailable(format!("injected failure for {name:?}")));
        }

        let mut container = self.container()?;
        if !container.exists {
            return Err(StorageError::Unavailable("container does not exist".to_owned()));
        }
        container.blobs.insert(name.to_owned(), body.to_vec());
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut container = self.container()?;
        let body = container
            .blobs
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::MissingObject(from.to_owned()))?;
        container.blobs.insert(to.to_owned(), body);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .container()?
            .blobs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[tokio::test]
async fn put_requires_container() {
    let store = InMemStore::new();
    assert!(matches!(
        store.put("a", b"x").await,
        Err(StorageError::Unavailable(_))
    ));
    store.ensure_container().await.unwrap();
    store.ensure_container().await.unwrap();
    store.put("a", b"x").await.unwrap();
    assert_eq!(store.get("a").await.unwrap(), Some(b"x".to_vec()));
}

#[tokio::test]
async fn copy_overwrites() {
    let store = InMemStore::new();
    store.ensure_container().await.unwrap();
    store.put("a/1", b"one").await.unwrap();
    store.put("b", b"old").await.unwrap();
    store.copy("a/1", "b").await.unwrap();
    assert_eq!(store.get("b").await.unwrap(), Some(b"one".to_vec()));
    assert!(matches!(
        store.copy("nope", "b").await,
        Err(StorageError::MissingObject(_))
    ));
}

#[tokio::test]
async fn list_dirs_works() {
    let store = InMemStore::new();
    store.ensure_container().await.unwrap();
    for name in [
        "state",
        "current/model",
        "20240102/101010/state",
        "20240102/101011/state",
        "20240101/090000/model",
    ] {
        store.put(name, b"").await.unwrap();
    }

    let found = store.list_dirs("").await.unwrap();
    assert_eq!(found, vec!["20240101", "20240102", "current"]);
    let found = store.list_dirs("20240102/").await.unwrap();
    assert_eq!(found, vec!["20240102/101010", "20240102/101011"]);
    assert_eq!(store.list_calls(), 2);
}

#[tokio::test]
async fn injected_put_failure() {
    let store = InMemStore::new();
    store.ensure_container().await.unwrap();
    store.fail_puts_ending_with(Some("/model"));
    assert!(store.put("x/model", b"").await.is_err());
    store.put("x/model.trackback", b"").await.unwrap();
    store.fail_puts_ending_with(None);
    store.put("x/model", b"").await.unwrap();
}
