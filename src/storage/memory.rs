//! In-Memory Transactional Storage Engine
//!
//! `MemEnv` implements the [`Environment`] seam entirely in process memory.
//! It keeps the semantics the expiration engine relies on and nothing more:
//!
//! 1. **Named ordered tables**: every database is a `BTreeMap<Bytes, Bytes>`,
//!    so cursors always walk in byte order.
//! 2. **Undo-log transactions**: writes apply in place and record the previous
//!    value; abort replays the log backwards. A nested transaction hands its
//!    log to the parent on commit.
//! 3. **Exclusive key locks**: writes and read-modify-write reads lock the key
//!    for the root transaction until it finishes. A conflicting request fails
//!    immediately with `LockNotGranted` instead of waiting.
//! 4. **Handle generations**: each table carries a generation counter. Bumping
//!    it (see [`MemEnv::simulate_role_change`]) kills every open handle the way
//!    a replication role change does.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         MemEnv                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ tables       │  │ lock table   │  │ counters         │   │
//! │  │ RwLock<Map>  │  │ Mutex<Map>   │  │ atomics          │   │
//! │  └──────┬───────┘  └──────────────┘  └──────────────────┘   │
//! │         │                                                   │
//! │  ┌──────▼───────┐ ┌──────────────┐                          │
//! │  │ Table        │ │ Table        │  ...                     │
//! │  │ RwLock<BTree>│ │ RwLock<BTree>│                          │
//! │  └──────────────┘ └──────────────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Under `ReadUncommitted` reads ignore locks; under `ReadCommitted` a read of
//! a key locked by another transaction fails with `LockNotGranted`.

use crate::error::{StoreError, StoreResult};
use crate::storage::{Cursor, Database, DbKind, Environment, Isolation, LockMode, Transaction};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A single named table.
#[derive(Debug)]
struct Table {
    name: String,
    kind: DbKind,
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    /// Handles opened under an older generation are dead
    generation: AtomicU64,
}

impl Table {
    fn new(name: &str, kind: DbKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            data: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

/// State shared by the environment and every handle, transaction and cursor.
#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<HashMap<String, Arc<Table>>>,

    /// (database, key) -> id of the root transaction holding the lock
    locks: Mutex<HashMap<(String, Bytes), u64>>,

    next_txn_id: AtomicU64,

    /// Opens that should fail with `NotReady` before succeeding again
    pending_open_failures: AtomicUsize,

    /// Statistics: handles currently open
    open_handles: AtomicUsize,

    /// Statistics: root transactions committed
    commit_count: AtomicU64,

    /// Statistics: root transactions aborted
    abort_count: AtomicU64,

    /// Statistics: lock requests refused
    lock_conflicts: AtomicU64,
}

impl Shared {
    fn acquire(&self, db: &str, key: &[u8], owner: Option<u64>) -> StoreResult<()> {
        let mut locks = self.locks.lock();
        let lock_key = (db.to_string(), Bytes::copy_from_slice(key));

        match (locks.get(&lock_key).copied(), owner) {
            (Some(holder), Some(id)) if holder == id => Ok(()),
            (Some(_), _) => {
                self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::LockNotGranted { db: db.to_string() })
            }
            (None, Some(id)) => {
                locks.insert(lock_key, id);
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    /// A committed read must not observe a key another transaction is writing.
    fn check_readable(&self, db: &str, key: &[u8], owner: Option<u64>) -> StoreResult<()> {
        let locks = self.locks.lock();
        match locks.get(&(db.to_string(), Bytes::copy_from_slice(key))) {
            Some(&holder) if Some(holder) != owner => {
                self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::LockNotGranted { db: db.to_string() })
            }
            _ => Ok(()),
        }
    }

    fn release(&self, owner: u64) {
        self.locks.lock().retain(|_, holder| *holder != owner);
    }
}

/// Point-in-time counters for a [`MemEnv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEnvStats {
    pub tables: usize,
    pub open_handles: usize,
    pub commits: u64,
    pub aborts: u64,
    pub lock_conflicts: u64,
}

/// In-memory storage environment.
///
/// Cloning is cheap; clones share the same tables.
///
/// # Example
///
/// ```
/// use reapkv::storage::{Database, DbKind, Environment, LockMode, MemEnv};
///
/// let env = MemEnv::new();
/// let orders = env.open_db("orders.db", DbKind::Btree, true).unwrap();
/// orders.put(None, b"42", b"pending").unwrap();
/// assert_eq!(&orders.get(None, b"42", LockMode::Shared).unwrap()[..], b"pending");
/// ```
#[derive(Clone, Default)]
pub struct MemEnv {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemEnv")
            .field("tables", &stats.tables)
            .field("open_handles", &stats.open_handles)
            .field("commits", &stats.commits)
            .field("aborts", &stats.aborts)
            .finish()
    }
}

impl MemEnv {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a database if it does not exist yet.
    ///
    /// This plays the part of another process with creation rights.
    pub fn create_db(&self, name: &str, kind: DbKind) {
        self.shared
            .tables
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Table::new(name, kind)));
    }

    /// Invalidates every open handle, as a replication role change does.
    pub fn simulate_role_change(&self) {
        for table in self.shared.tables.read().values() {
            table.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Invalidates the open handles of one database.
    ///
    /// Returns `false` if the database does not exist.
    pub fn kill_handles(&self, name: &str) -> bool {
        match self.shared.tables.read().get(name) {
            Some(table) => {
                table.generation.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Makes the next `count` opens fail with `NotReady`.
    pub fn fail_next_opens(&self, count: usize) {
        self.shared
            .pending_open_failures
            .store(count, Ordering::Release);
    }

    /// Returns true if the database exists.
    pub fn has_db(&self, name: &str) -> bool {
        self.shared.tables.read().contains_key(name)
    }

    /// Reads a key directly, bypassing handles, transactions and locks.
    pub fn peek(&self, name: &str, key: &[u8]) -> Option<Bytes> {
        let tables = self.shared.tables.read();
        let table = tables.get(name)?;
        let data = table.data.read();
        data.get(key).cloned()
    }

    /// Number of entries in a database (0 if it does not exist).
    pub fn len(&self, name: &str) -> usize {
        self.shared
            .tables
            .read()
            .get(name)
            .map(|t| t.data.read().len())
            .unwrap_or(0)
    }

    /// All entries of a database in key order.
    pub fn entries(&self, name: &str) -> Vec<(Bytes, Bytes)> {
        self.shared
            .tables
            .read()
            .get(name)
            .map(|t| {
                t.data
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of handles that are open right now.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::Acquire)
    }

    pub fn commits(&self) -> u64 {
        self.shared.commit_count.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.shared.abort_count.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> MemEnvStats {
        MemEnvStats {
            tables: self.shared.tables.read().len(),
            open_handles: self.open_handles(),
            commits: self.commits(),
            aborts: self.aborts(),
            lock_conflicts: self.shared.lock_conflicts.load(Ordering::Relaxed),
        }
    }

    fn handle(&self, table: Arc<Table>) -> MemDb {
        self.shared.open_handles.fetch_add(1, Ordering::AcqRel);
        MemDb {
            generation: table.generation.load(Ordering::Acquire),
            table,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Environment for MemEnv {
    type Txn = MemTxn;
    type Db = MemDb;

    fn open_db(&self, name: &str, kind: DbKind, create: bool) -> StoreResult<MemDb> {
        let failures = &self.shared.pending_open_failures;
        if failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::NotReady(name.to_string()));
        }

        if let Some(table) = self.shared.tables.read().get(name) {
            if kind != DbKind::Unknown && kind != table.kind {
                return Err(StoreError::InvalidArgument(format!(
                    "{} is a {:?} database, not {:?}",
                    name, table.kind, kind
                )));
            }
            return Ok(self.handle(Arc::clone(table)));
        }
        if !create || kind == DbKind::Unknown {
            return Err(StoreError::NoSuchDatabase(name.to_string()));
        }

        let table = {
            let mut tables = self.shared.tables.write();
            Arc::clone(
                tables
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Table::new(name, kind))),
            )
        };
        Ok(self.handle(table))
    }

    fn begin(&self, isolation: Isolation) -> StoreResult<MemTxn> {
        let id = self.shared.next_txn_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MemTxn {
            state: Arc::new(TxnState {
                root_id: id,
                isolation,
                undo: Mutex::new(Vec::new()),
                parent: None,
                finished: AtomicBool::new(false),
            }),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// One reversible write.
#[derive(Debug)]
struct Undo {
    table: Arc<Table>,
    key: Bytes,
    previous: Option<Bytes>,
}

fn rollback(undo: Vec<Undo>) {
    for entry in undo.into_iter().rev() {
        let mut data = entry.table.data.write();
        match entry.previous {
            Some(value) => {
                data.insert(entry.key, value);
            }
            None => {
                data.remove(&entry.key);
            }
        }
    }
}

#[derive(Debug)]
struct TxnState {
    /// Locks are owned by the root; nested transactions share its id
    root_id: u64,
    isolation: Isolation,
    undo: Mutex<Vec<Undo>>,
    parent: Option<Arc<TxnState>>,
    finished: AtomicBool,
}

impl TxnState {
    /// A transaction is usable while neither it nor any ancestor finished.
    fn live(&self) -> StoreResult<()> {
        let mut state = Some(self);
        while let Some(current) = state {
            if current.finished.load(Ordering::Acquire) {
                return Err(StoreError::TxnFinished);
            }
            state = current.parent.as_deref();
        }
        Ok(())
    }

    fn record(&self, table: &Arc<Table>, key: Bytes, previous: Option<Bytes>) {
        self.undo.lock().push(Undo {
            table: Arc::clone(table),
            key,
            previous,
        });
    }
}

/// A transaction in a [`MemEnv`]. Dropping it unfinished aborts it.
#[derive(Debug)]
pub struct MemTxn {
    state: Arc<TxnState>,
    shared: Arc<Shared>,
}

impl MemTxn {
    fn finish(&self, commit: bool) -> StoreResult<()> {
        if self.state.finished.swap(true, Ordering::AcqRel) {
            return Err(StoreError::TxnFinished);
        }
        let undo = std::mem::take(&mut *self.state.undo.lock());

        match (&self.state.parent, commit) {
            (Some(parent), true) => {
                if parent.finished.load(Ordering::Acquire) {
                    rollback(undo);
                    return Err(StoreError::TxnFinished);
                }
                parent.undo.lock().extend(undo);
            }
            (Some(_), false) => rollback(undo),
            (None, true) => {
                self.shared.release(self.state.root_id);
                self.shared.commit_count.fetch_add(1, Ordering::Relaxed);
            }
            (None, false) => {
                rollback(undo);
                self.shared.release(self.state.root_id);
                self.shared.abort_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Transaction for MemTxn {
    fn nested(&self) -> StoreResult<Self> {
        self.state.live()?;
        Ok(MemTxn {
            state: Arc::new(TxnState {
                root_id: self.state.root_id,
                isolation: self.state.isolation,
                undo: Mutex::new(Vec::new()),
                parent: Some(Arc::clone(&self.state)),
                finished: AtomicBool::new(false),
            }),
            shared: Arc::clone(&self.shared),
        })
    }

    fn commit(self) -> StoreResult<()> {
        self.finish(true)
    }

    fn abort(self) -> StoreResult<()> {
        self.finish(false)
    }
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if !self.state.finished.load(Ordering::Acquire) {
            let _ = self.finish(false);
        }
    }
}

/// An open handle to a [`MemEnv`] table.
#[derive(Debug)]
pub struct MemDb {
    table: Arc<Table>,
    shared: Arc<Shared>,
    generation: u64,
}

impl MemDb {
    fn check_alive(&self) -> StoreResult<()> {
        if self.table.generation.load(Ordering::Acquire) != self.generation {
            return Err(StoreError::HandleDead(self.table.name.clone()));
        }
        Ok(())
    }

    fn txn_state<'a>(&self, txn: Option<&'a MemTxn>) -> StoreResult<Option<&'a Arc<TxnState>>> {
        match txn {
            Some(txn) => {
                txn.state.live()?;
                Ok(Some(&txn.state))
            }
            None => Ok(None),
        }
    }

    /// Applies a write and records it for undo.
    fn write(&self, txn: Option<&MemTxn>, key: &[u8], value: Option<&[u8]>) -> StoreResult<()> {
        self.check_alive()?;
        let state = self.txn_state(txn)?;
        self.shared
            .acquire(&self.table.name, key, state.map(|s| s.root_id))?;

        let key = Bytes::copy_from_slice(key);
        let previous = {
            let mut data = self.table.data.write();
            match value {
                Some(value) => data.insert(key.clone(), Bytes::copy_from_slice(value)),
                None => match data.remove(&key) {
                    Some(previous) => Some(previous),
                    None => return Err(StoreError::NotFound),
                },
            }
        };

        if let Some(state) = state {
            state.record(&self.table, key, previous);
        }
        Ok(())
    }
}

impl Drop for MemDb {
    fn drop(&mut self) {
        self.shared.open_handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Database for MemDb {
    type Txn = MemTxn;
    type Cursor = MemCursor;

    fn name(&self) -> &str {
        &self.table.name
    }

    fn get(&self, txn: Option<&MemTxn>, key: &[u8], lock: LockMode) -> StoreResult<Bytes> {
        self.check_alive()?;
        let state = self.txn_state(txn)?;
        let owner = state.map(|s| s.root_id);

        match lock {
            LockMode::Write => self.shared.acquire(&self.table.name, key, owner)?,
            LockMode::Shared => {
                let isolation = state.map(|s| s.isolation).unwrap_or(Isolation::ReadCommitted);
                if isolation == Isolation::ReadCommitted {
                    self.shared.check_readable(&self.table.name, key, owner)?;
                }
            }
        }

        self.table
            .data
            .read()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn put(&self, txn: Option<&MemTxn>, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.write(txn, key, Some(value))
    }

    fn delete(&self, txn: Option<&MemTxn>, key: &[u8]) -> StoreResult<()> {
        self.write(txn, key, None)
    }

    fn cursor(&self, txn: &MemTxn) -> StoreResult<MemCursor> {
        self.check_alive()?;
        txn.state.live()?;
        Ok(MemCursor {
            table: Arc::clone(&self.table),
            shared: Arc::clone(&self.shared),
            generation: self.generation,
            txn: Arc::clone(&txn.state),
            position: None,
        })
    }

    fn close(self) -> StoreResult<()> {
        drop(self);
        Ok(())
    }
}

/// Forward cursor over a [`MemDb`].
///
/// The cursor remembers the last key it returned and resumes strictly after
/// it, so deleting the current entry never disturbs the walk.
#[derive(Debug)]
pub struct MemCursor {
    table: Arc<Table>,
    shared: Arc<Shared>,
    generation: u64,
    txn: Arc<TxnState>,
    position: Option<Bytes>,
}

impl MemCursor {
    fn check_alive(&self) -> StoreResult<()> {
        if self.table.generation.load(Ordering::Acquire) != self.generation {
            return Err(StoreError::HandleDead(self.table.name.clone()));
        }
        self.txn.live()
    }
}

impl Cursor for MemCursor {
    fn next(&mut self) -> StoreResult<Option<(Bytes, Bytes)>> {
        self.check_alive()?;

        let entry = {
            let data = self.table.data.read();
            let lower = match &self.position {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            data.range((lower, Bound::Unbounded))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()))
        };

        let Some((key, value)) = entry else {
            return Ok(None);
        };
        if self.txn.isolation == Isolation::ReadCommitted {
            self.shared
                .check_readable(&self.table.name, &key, Some(self.txn.root_id))?;
        }
        self.position = Some(key.clone());
        Ok(Some((key, value)))
    }

    fn delete_current(&mut self) -> StoreResult<()> {
        self.check_alive()?;
        let Some(key) = self.position.clone() else {
            return Err(StoreError::InvalidArgument(
                "cursor is not positioned".to_string(),
            ));
        };
        self.shared
            .acquire(&self.table.name, &key, Some(self.txn.root_id))?;

        let previous = self.table.data.write().remove(&key);
        match previous {
            Some(previous) => {
                self.txn.record(&self.table, key, Some(previous));
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}
