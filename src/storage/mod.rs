//! Storage Engine Seam
//!
//! The expiration engine does not own a storage engine; it drives one through
//! the traits in this module. They model a transactional, table-partitioned
//! embedded store:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Environment                           │
//! │   open_db(name, kind, create)          begin(isolation)     │
//! │        │                                     │              │
//! │        ▼                                     ▼              │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐  ┌───────────┐      │
//! │  │ Database │ │ Database │ │ Database │  │Transaction│      │
//! │  │ orders.db│ │__expire..│ │   ...    │  │ └ nested()│      │
//! │  └────┬─────┘ └──────────┘ └──────────┘  └───────────┘      │
//! │       │ cursor(txn)                                         │
//! │       ▼                                                     │
//! │  ┌──────────┐                                               │
//! │  │  Cursor  │  next() / delete_current()                    │
//! │  └──────────┘                                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Operations take `Option<&Txn>`: `None` runs the operation as its own
//! auto-committed unit. A handle may die underneath its owner (for example
//! after a replication role change); every operation on it then reports
//! [`StoreError::HandleDead`](crate::StoreError::HandleDead) and the owner must
//! reopen it.
//!
//! [`memory::MemEnv`] is the in-process implementation used by the demo
//! binary, the benchmark and the tests.

pub mod cache;
pub mod memory;

use crate::error::StoreResult;
use bytes::Bytes;

pub use cache::TableCache;
pub use memory::{MemCursor, MemDb, MemEnv, MemTxn};

/// Reserved name of the time-ordered primary expiry index.
pub const PRIMARY_INDEX_DB: &str = "__expire.db";

/// Reserved name of the key-ordered reverse expiry index.
pub const REVERSE_INDEX_DB: &str = "__expire.index.db";

/// Access method requested when opening a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    /// Ordered structure; cursors walk it in key order
    Btree,
    /// Hashed structure
    Hash,
    /// Use whatever already exists; never creates
    Unknown,
}

/// Isolation level for a root transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Reads may observe uncommitted writes of other transactions
    #[default]
    ReadUncommitted,
    /// Reads observe committed data only
    ReadCommitted,
}

/// Lock taken by a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Plain read
    #[default]
    Shared,
    /// Read-modify-write: the key stays exclusively locked until the root
    /// transaction finishes
    Write,
}

/// A storage environment that hands out databases and transactions.
pub trait Environment: Send + Sync + 'static {
    type Txn: Transaction;
    type Db: Database<Txn = Self::Txn>;

    /// Opens a database by name.
    ///
    /// With `create` set, a missing database is created; otherwise a missing
    /// database is [`StoreError::NoSuchDatabase`](crate::StoreError::NoSuchDatabase).
    /// `DbKind::Unknown` never creates.
    fn open_db(&self, name: &str, kind: DbKind, create: bool) -> StoreResult<Self::Db>;

    /// Begins a root transaction.
    fn begin(&self, isolation: Isolation) -> StoreResult<Self::Txn>;
}

/// A transaction. Dropping one without committing aborts it.
pub trait Transaction: Send + Sized + 'static {
    /// Begins a child transaction. Its commit folds its work into the parent;
    /// its abort undoes only its own work.
    fn nested(&self) -> StoreResult<Self>;

    fn commit(self) -> StoreResult<()>;

    fn abort(self) -> StoreResult<()>;
}

/// An open handle to one database.
pub trait Database: Send + Sized + 'static {
    type Txn: Transaction;
    type Cursor: Cursor;

    /// Name the handle was opened with.
    fn name(&self) -> &str;

    fn get(&self, txn: Option<&Self::Txn>, key: &[u8], lock: LockMode) -> StoreResult<Bytes>;

    fn put(&self, txn: Option<&Self::Txn>, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Deletes a key. A missing key is [`StoreError::NotFound`](crate::StoreError::NotFound).
    fn delete(&self, txn: Option<&Self::Txn>, key: &[u8]) -> StoreResult<()>;

    /// Opens a forward cursor inside `txn`.
    fn cursor(&self, txn: &Self::Txn) -> StoreResult<Self::Cursor>;

    /// Closes the handle.
    fn close(self) -> StoreResult<()>;
}

/// A forward cursor over a database in key order.
pub trait Cursor: Send {
    /// Advances to the next entry. `Ok(None)` when the walk is exhausted.
    fn next(&mut self) -> StoreResult<Option<(Bytes, Bytes)>>;

    /// Deletes the entry the cursor is positioned on.
    fn delete_current(&mut self) -> StoreResult<()>;
}
