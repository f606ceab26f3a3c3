//! Object store which does nothing.

use async_trait::async_trait;

use super::ObjectStore;
use crate::errors::StorageError;

/// Writes are dropped and reads are the same as an empty store.
///
/// Use this to run without checkpointing; recovery will always fresh
/// start.
#[derive(Debug, Default)]
pub struct NoOpStore;

impl NoOpStore {
    pub fn new() -> Self {
        NoOpStore {}
    }
}

#[async_trait]
impl ObjectStore for NoOpStore {
    async fn ensure_container(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get(&self, _name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }

    async fn put(&self, _name: &str, _body: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }

    async fn copy(&self, _from: &str, _to: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}
