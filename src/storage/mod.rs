//! Durable object storage for checkpoints.
//!
//! A store is modeled as a single container of named blobs. Names
//! use `/` to form virtual directories, which is all the checkpoint
//! layout in [`crate::checkpoint`] relies on.
//!
//! There is one trait to implement to make a new store:
//! [`ObjectStore`]. [`in_mem`], [`noop`] and [`sqlite`] are the
//! implementations shipped with the crate.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::StorageError;

pub mod in_mem;
pub mod noop;
pub mod sqlite;

pub use in_mem::InMemStore;
pub use noop::NoOpStore;
pub use sqlite::SqliteStore;

/// A container of named blobs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the container if it does not exist yet.
    async fn ensure_container(&self) -> Result<(), StorageError>;

    /// Read a blob. Missing blobs, or a missing container, are
    /// `Ok(None)`.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Create or overwrite a blob.
    async fn put(&self, name: &str, body: &[u8]) -> Result<(), StorageError>;

    /// Server-side copy of a blob, overwriting `to`.
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Names of all blobs starting with `prefix`, in name order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Virtual directories directly under `prefix`, without trailing
    /// `/`, in name order.
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut dirs = BTreeSet::new();
        for name in self.list(prefix).await? {
            if let Some((dir, _rest)) = name[prefix.len()..].split_once('/') {
                dirs.insert(format!("{prefix}{dir}"));
            }
        }
        Ok(dirs.into_iter().collect())
    }
}

/// Build the configured store.
pub fn build_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let store: Arc<dyn ObjectStore> = match &config.backend {
        StorageBackend::Memory => Arc::new(InMemStore::new()),
        StorageBackend::Sqlite { path } => Arc::new(SqliteStore::open(path, &config.container)?),
        StorageBackend::None => Arc::new(NoOpStore::new()),
    };
    Ok(store)
}
