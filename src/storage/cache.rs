//! Table Handle Cache
//!
//! The reaper deletes from whichever table an expired key belongs to. Opening a
//! handle per delete would be wasteful, so handles are memoized by table name.
//!
//! The cache has exactly one owner (the reaper task) and is never shared, so
//! it needs no locking. It owns the handles it holds: every path that removes
//! a handle (replacement, eviction, drain, drop) closes it.

use crate::error::StoreResult;
use crate::keyspace::table_db_name;
use crate::storage::{Database, DbKind, Environment};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Memoized per-table storage handles, keyed by table name.
#[derive(Debug)]
pub struct TableCache<D: Database> {
    handles: HashMap<Bytes, D>,
}

impl<D: Database> Default for TableCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Database> TableCache<D> {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Returns the cached handle for `table`, if any.
    pub fn find(&self, table: &[u8]) -> Option<&D> {
        self.handles.get(table)
    }

    /// Caches `handle` for `table`, closing the handle it replaces.
    pub fn insert_or_replace(&mut self, table: Bytes, handle: D) {
        if let Some(old) = self.handles.insert(table, handle) {
            close_handle(old);
        }
    }

    /// Closes and forgets the handle for `table`.
    ///
    /// Returns `true` if there was one.
    pub fn evict(&mut self, table: &[u8]) -> bool {
        match self.handles.remove(table) {
            Some(handle) => {
                debug!(
                    table = %String::from_utf8_lossy(table),
                    "Evicted table handle"
                );
                close_handle(handle);
                true
            }
            None => false,
        }
    }

    /// Closes every cached handle.
    pub fn drain(&mut self) {
        for (_, handle) in self.handles.drain() {
            close_handle(handle);
        }
    }

    /// Returns the handle for `table`, opening and caching it on first use.
    ///
    /// Target tables are opened as `DbKind::Unknown` and never created: a
    /// table that does not exist holds no data to expire.
    pub fn resolve<E>(&mut self, env: &E, table: &[u8]) -> StoreResult<&D>
    where
        E: Environment<Db = D>,
    {
        match self.handles.entry(Bytes::copy_from_slice(table)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let handle = env.open_db(&table_db_name(table), DbKind::Unknown, false)?;
                debug!(db = handle.name(), "Opened table handle");
                Ok(entry.insert(handle))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<D: Database> Drop for TableCache<D> {
    fn drop(&mut self) {
        self.drain();
    }
}

fn close_handle<D: Database>(handle: D) {
    let name = handle.name().to_string();
    if let Err(e) = handle.close() {
        warn!(op = "close", db = %name, code = e.code(), error = %e, "Failed to close handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::{LockMode, MemDb, MemEnv};

    fn env_with_tables(names: &[&str]) -> MemEnv {
        let env = MemEnv::new();
        for name in names {
            env.create_db(&table_db_name(name.as_bytes()), DbKind::Btree);
        }
        env
    }

    #[test]
    fn test_resolve_opens_once() {
        let env = env_with_tables(&["orders"]);
        let mut cache: TableCache<MemDb> = TableCache::new();

        assert!(cache.find(b"orders").is_none());
        let db = cache.resolve(&env, b"orders").unwrap();
        assert_eq!(db.name(), "orders.db");

        cache.resolve(&env, b"orders").unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(env.open_handles(), 1);
        assert!(cache.find(b"orders").is_some());
    }

    #[test]
    fn test_resolve_missing_table() {
        let env = MemEnv::new();
        let mut cache: TableCache<MemDb> = TableCache::new();

        assert_eq!(
            cache.resolve(&env, b"ghost").unwrap_err(),
            StoreError::NoSuchDatabase("ghost.db".into())
        );
        assert!(cache.is_empty());
        assert!(!env.has_db("ghost.db"));
    }

    #[test]
    fn test_replace_closes_old_handle() {
        let env = env_with_tables(&["orders"]);
        let mut cache = TableCache::new();

        let first = env.open_db("orders.db", DbKind::Unknown, false).unwrap();
        let second = env.open_db("orders.db", DbKind::Unknown, false).unwrap();
        assert_eq!(env.open_handles(), 2);

        cache.insert_or_replace(Bytes::from("orders"), first);
        cache.insert_or_replace(Bytes::from("orders"), second);
        assert_eq!(env.open_handles(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_closes_and_reopens() {
        let env = env_with_tables(&["orders"]);
        let mut cache: TableCache<MemDb> = TableCache::new();
        cache.resolve(&env, b"orders").unwrap();

        env.kill_handles("orders.db");
        let err = cache
            .find(b"orders")
            .unwrap()
            .get(None, b"42", LockMode::Shared)
            .unwrap_err();
        assert!(err.is_handle_dead());

        assert!(cache.evict(b"orders"));
        assert!(!cache.evict(b"orders"));
        assert_eq!(env.open_handles(), 0);

        let db = cache.resolve(&env, b"orders").unwrap();
        assert_eq!(db.get(None, b"42", LockMode::Shared), Err(StoreError::NotFound));
    }

    #[test]
    fn test_drain_closes_everything() {
        let env = env_with_tables(&["a", "b", "c"]);
        let mut cache: TableCache<MemDb> = TableCache::new();
        for table in ["a", "b", "c"] {
            cache.resolve(&env, table.as_bytes()).unwrap();
        }
        assert_eq!(env.open_handles(), 3);

        cache.drain();
        assert!(cache.is_empty());
        assert_eq!(env.open_handles(), 0);
    }

    #[test]
    fn test_drop_closes_everything() {
        let env = env_with_tables(&["a"]);
        {
            let mut cache: TableCache<MemDb> = TableCache::new();
            cache.resolve(&env, b"a").unwrap();
            assert_eq!(env.open_handles(), 1);
        }
        assert_eq!(env.open_handles(), 0);
    }
}
