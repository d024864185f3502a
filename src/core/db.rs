//! Key-value document store.
//!
//! Records are JSON documents under namespaced keys (`user:{id}`,
//! `post:{id}`, ...). `update` is the only read-modify-write primitive and
//! runs in a single transaction under the store's lock, so counters and id lists never lose writes
//! to a concurrent request.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

pub type UpdateFn<'a> = dyn FnMut(Option<Vec<u8>>) -> anyhow::Result<Option<Vec<u8>>> + 'a;

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Atomically replaces the value under `key` with whatever `f` returns.
    /// Returning `None` removes the key.
    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> anyhow::Result<()>;
}

/// JSON helpers on top of the raw byte API.
pub trait StoreExt: Store {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).with_context(|| format!("corrupt document at {key}"))?,
            )),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        self.set(key, &serde_json::to_vec(value)?)
    }

    /// Applies `f` to an existing document. Returns the new value, or `None`
    /// when nothing is stored under `key`.
    fn update_json<T, F>(&self, key: &str, f: F) -> anyhow::Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let mut f = Some(f);
        let mut updated = None;
        self.update(key, &mut |current| {
            let Some(bytes) = current else {
                return Ok(None);
            };
            let mut value: T = serde_json::from_slice(&bytes)?;
            if let Some(f) = f.take() {
                f(&mut value);
            }
            let encoded = serde_json::to_vec(&value)?;
            updated = Some(value);
            Ok(Some(encoded))
        })?;
        Ok(updated)
    }

    /// Like `update_json`, starting from `T::default()` when the key is absent.
    fn upsert_json<T, F>(&self, key: &str, f: F) -> anyhow::Result<()>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let mut f = Some(f);
        self.update(key, &mut |current| {
            let mut value: T = match current {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => T::default(),
            };
            if let Some(f) = f.take() {
                f(&mut value);
            }
            Ok(Some(serde_json::to_vec(&value)?))
        })
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);";

/// SQLite-backed store: one `documents` row per key. A single connection
/// behind a mutex serialises writers; `update` runs inside a transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Private database that lives as long as the store.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA).context("failed to create schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite store lock poisoned"))
    }
}

fn read(conn: &Connection, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
    conn.query_row("SELECT value FROM documents WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
}

fn write(conn: &Connection, key: &str, value: &[u8]) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO documents (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn remove(conn: &Connection, key: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM documents WHERE key = ?1", params![key])?;
    Ok(())
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        read(&*self.conn()?, key).with_context(|| format!("failed to read {key}"))
    }

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        write(&*self.conn()?, key, value).with_context(|| format!("failed to write {key}"))
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        remove(&*self.conn()?, key).with_context(|| format!("failed to delete {key}"))
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> anyhow::Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match f(read(&tx, key)?)? {
            Some(value) => write(&tx, key, &value)?,
            None => remove(&tx, key)?,
        }
        tx.commit().with_context(|| format!("failed to commit {key}"))
    }
}

/// Wraps a store and fails writes to keys under `prefix` while `remaining`
/// is non-zero. Used to exercise partial-failure paths.
#[cfg(test)]
pub(crate) struct FlakyStore {
    pub inner: SqliteStore,
    prefix: String,
    remaining: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FlakyStore {
    pub fn new(prefix: &str, failures: usize) -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            prefix: prefix.to_string(),
            remaining: std::sync::atomic::AtomicUsize::new(failures),
        }
    }

    pub fn fail_next(&self, failures: usize) {
        self.remaining.store(failures, std::sync::atomic::Ordering::SeqCst);
    }

    fn trip(&self, key: &str) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;
        if key.starts_with(&self.prefix)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            anyhow::bail!("injected write failure on {key}");
        }
        Ok(())
    }
}

#[cfg(test)]
impl Store for FlakyStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.trip(key)?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.trip(key)?;
        self.inner.delete(key)
    }

    fn update(&self, key: &str, f: &mut UpdateFn<'_>) -> anyhow::Result<()> {
        self.trip(key)?;
        self.inner.update(key, f)
    }
}
