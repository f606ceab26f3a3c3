//! SQLite implementation of an object store.
//!
//! All containers live in one DB file; each blob is a row keyed by
//! `(container, name)`. Connection access is serialized and run on
//! the blocking thread pool so storage I/O never stalls a runtime
//! worker.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::ObjectStore;
use crate::errors::StorageError;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE containers ( \
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             name TEXT NOT NULL PRIMARY KEY \
             ) STRICT",
        ),
        M::up(
            "CREATE TABLE blobs ( \
             updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             container TEXT NOT NULL REFERENCES containers (name), \
             name TEXT NOT NULL, \
             body BLOB NOT NULL, \
             PRIMARY KEY (container, name) \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), StorageError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations().to_latest(conn)?;
    Ok(())
}

/// Blobs in a container in an SQLite DB.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    container: String,
}

impl SqliteStore {
    pub fn open(db_file: &Path, container: &str) -> Result<Self, StorageError> {
        let mut conn = Connection::open(db_file)?;
        tracing::debug!("Opened Sqlite connection to {db_file:?}");
        setup_conn(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            container: container.to_owned(),
        })
    }

    /// Run `f` with the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let container = self.container.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("sqlite connection poisoned".to_owned()))?;
            f(&mut conn, &container)
        })
        .await?
    }
}

fn container_exists(conn: &Connection, container: &str) -> Result<bool, StorageError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM containers WHERE name = ?1",
            params![container],
            |_row| Ok(()),
        )
        .optional()?
        .is_some())
}

#[async_trait]
impl ObjectStore for SqliteStore {
    #[tracing::instrument(name = "SqliteStore.ensure_container", level = "trace", skip_all)]
    async fn ensure_container(&self) -> Result<(), StorageError> {
        self.with_conn(|conn, container| {
            conn.execute(
                "INSERT INTO containers (name) VALUES (?1) ON CONFLICT (name) DO NOTHING",
                params![container],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let name = name.to_owned();
        self.with_conn(move |conn, container| {
            Ok(conn
                .query_row(
                    "SELECT body FROM blobs WHERE container = ?1 AND name = ?2",
                    params![container, name],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    #[tracing::instrument(name = "SqliteStore.put", level = "trace", skip(self, body))]
    async fn put(&self, name: &str, body: &[u8]) -> Result<(), StorageError> {
        let name = name.to_owned();
        let body = body.to_vec();
        self.with_conn(move |conn, container| {
            if !container_exists(conn, container)? {
                return Err(StorageError::Unavailable(format!(
                    "container {container:?} does not exist"
                )));
            }
            conn.execute(
                "INSERT INTO blobs (container, name, body) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (container, name) DO UPDATE \
                 SET body = EXCLUDED.body, updated_at = CURRENT_TIMESTAMP",
                params![container, name, body],
            )?;
            Ok(())
        })
        .await
    }

    #[tracing::instrument(name = "SqliteStore.copy", level = "trace", skip(self))]
    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = from.to_owned();
        let to = to.to_owned();
        self.with_conn(move |conn, container| {
            let copied = conn.execute(
                "INSERT INTO blobs (container, name, body) \
                 SELECT container, ?3, body FROM blobs \
                 WHERE container = ?1 AND name = ?2 \
                 ON CONFLICT (container, name) DO UPDATE \
                 SET body = EXCLUDED.body, updated_at = CURRENT_TIMESTAMP",
                params![container, from, to],
            )?;
            if copied == 0 {
                return Err(StorageError::MissingObject(from));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.with_conn(move |conn, container| {
            let mut stmt = conn.prepare(
                "SELECT name FROM blobs \
                 WHERE container = ?1 AND substr(name, 1, length(?2)) = ?2 \
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map(params![container, prefix], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }
}

#[cfg(test)]
fn temp_store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("checkpoints.sqlite3"), "trainer").unwrap();
    (store, dir)
}

#[tokio::test]
async fn put_get_works() {
    let (store, _dir) = temp_store();
    assert_eq!(store.get("state").await.unwrap(), None);
    assert!(matches!(
        store.put("state", b"x").await,
        Err(StorageError::Unavailable(_))
    ));

    store.ensure_container().await.unwrap();
    store.ensure_container().await.unwrap();
    store.put("state", b"one").await.unwrap();
    store.put("state", b"two").await.unwrap();
    assert_eq!(store.get("state").await.unwrap(), Some(b"two".to_vec()));
}

#[tokio::test]
async fn copy_works() {
    let (store, _dir) = temp_store();
    store.ensure_container().await.unwrap();
    store.put("20240101/000000/state", b"s").await.unwrap();
    store.copy("20240101/000000/state", "state").await.unwrap();
    store.copy("20240101/000000/state", "state").await.unwrap();
    assert_eq!(store.get("state").await.unwrap(), Some(b"s".to_vec()));
    assert!(matches!(
        store.copy("missing", "state").await,
        Err(StorageError::MissingObject(_))
    ));
}

#[tokio::test]
async fn list_is_per_container_and_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.sqlite3");
    let store = SqliteStore::open(&path, "a").unwrap();
    store.ensure_container().await.unwrap();
    store.put("20240101/000000/state", b"").await.unwrap();
    store.put("20240102/000000/state", b"").await.unwrap();
    store.put("state", b"").await.unwrap();
    drop(store);

    let other = SqliteStore::open(&path, "b").unwrap();
    other.ensure_container().await.unwrap();
    other.put("20240103/000000/state", b"").await.unwrap();
    assert_eq!(
        other.list("").await.unwrap(),
        vec!["20240103/000000/state".to_owned()]
    );

    let store = SqliteStore::open(&path, "a").unwrap();
    assert_eq!(
        store.list("20240101/").await.unwrap(),
        vec!["20240101/000000/state".to_owned()]
    );
    assert_eq!(
        store.list_dirs("").await.unwrap(),
        vec!["20240101".to_owned(), "20240102".to_owned()]
    );
}
