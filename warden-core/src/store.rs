use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not open state database '{path}': {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("poisoned store")]
    Poisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A small durable key-value store.
///
/// Keys are raw bytes because some key families embed NUL separators.
/// Implementations must make each call atomic with respect to other
/// processes on the same host; there is no cross-call transaction.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;
    /// Returns true when the key existed.
    fn delete(&self, key: &[u8]) -> StoreResult<bool>;
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Drop every entry.
    fn clear(&self) -> StoreResult<()>;

    fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// SQLite-backed store, one file per logical database.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path.as_ref()).map_err(|source| StoreError::Open {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Self { conn })
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, value) = row?;
            if key.starts_with(prefix) {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    fn clear(&self) -> StoreResult<()> {
        self.conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}

/// In-memory store for tests and for injecting scratch state.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<bool> {
        let mut map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map.remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> StoreResult<()> {
        let mut map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get(b"a").unwrap(), None);
        store.put(b"a", b"1").unwrap();
        store.put(b"ab", b"2").unwrap();
        store.put(b"b", b"3").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.put(b"a", b"9").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"9".to_vec()));

        let hits = store.scan_prefix(b"a").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"a".to_vec());
        assert_eq!(hits[1].0, b"ab".to_vec());

        assert!(store.delete(b"a").unwrap());
        assert!(!store.delete(b"a").unwrap());
        assert_eq!(store.get(b"a").unwrap(), None);

        store.clear().unwrap();
        assert!(store.scan_prefix(b"").unwrap().is_empty());
    }

    #[test]
    fn mem_store_contract() {
        exercise(&MemStore::new());
    }

    #[test]
    fn sqlite_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kv.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn sqlite_keys_with_embedded_nul() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("kv.db")).unwrap();
        let key = b"H_SHA256\0/etc/passwd".to_vec();
        store.put(&key, b"\x01\x02").unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(vec![1, 2]));
        let hits = store.scan_prefix(b"H_").unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(b"k", b"v").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
