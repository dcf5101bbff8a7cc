//! Expiry Index
//!
//! Two structures track pending expirations:
//!
//! ```text
//!  primary  "__expire.db"         stamp ++ key  ->  key      (time ordered)
//!  reverse  "__expire.index.db"   key           ->  stamp    (one per key)
//! ```
//!
//! The write path registers a TTL by writing both entries in one transaction.
//! Re-registering a key overwrites its reverse entry but leaves the old
//! primary entry behind. That entry is *stale*: when the reaper reaches it,
//! the reverse index no longer holds its stamp and the entry is dropped
//! without touching the data.
//!
//! ## Validate-and-delete
//!
//! ```text
//! candidate (stamp, key)
//!      │
//!      ▼
//! reverse.get(key, RMW) ── absent ──────────────> Missing      (no-op)
//!      │ ── stamp differs ─────────────────────> Superseded   (no-op)
//!      ▼
//! reverse.delete(key) ──── absent ──────────────> LostRace     (no-op)
//!      │
//!      ▼
//! split_key ─> TableCache ─> table.delete(name)
//!      │                          └── absent ──> TargetMissing (ok)
//!      ▼
//!   Reaped
//! ```

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};
use crate::expiry::stamp::{ExpiryStamp, STAMP_LEN};
use crate::keyspace::split_key;
use crate::storage::{
    Database, DbKind, Environment, Isolation, LockMode, TableCache, Transaction,
    PRIMARY_INDEX_DB, REVERSE_INDEX_DB,
};
use bytes::Bytes;
use tracing::{debug, trace, warn};

/// A decoded primary index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryEntry {
    pub stamp: ExpiryStamp,
    /// Namespaced key the registration governs
    pub target: Bytes,
}

impl PrimaryEntry {
    /// Decodes a raw primary index record.
    ///
    /// The key must be an encoded stamp followed by the same target key the
    /// value holds; anything else is malformed.
    pub fn decode(key: &[u8], value: &Bytes) -> StoreResult<Self> {
        if key.len() < STAMP_LEN {
            return Err(StoreError::malformed(
                PRIMARY_INDEX_DB,
                format!("key is {} bytes, shorter than a stamp", key.len()),
            ));
        }
        let stamp = ExpiryStamp::decode(&key[..STAMP_LEN], PRIMARY_INDEX_DB)?;
        if key[STAMP_LEN..] != value[..] {
            return Err(StoreError::malformed(
                PRIMARY_INDEX_DB,
                "key suffix does not match the target key",
            ));
        }
        Ok(Self {
            stamp,
            target: value.clone(),
        })
    }
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The registration was current; its data record was deleted
    Reaped,
    /// The registration was current but the data was already gone
    TargetMissing,
    /// No registration exists for the key any more
    Missing,
    /// A newer registration governs the key; nothing was deleted
    Superseded { current: ExpiryStamp },
    /// The reverse entry vanished between the read and the delete
    LostRace,
}

/// Open handles on the primary and reverse expiry indexes.
#[derive(Debug)]
pub struct ExpiryIndex<D: Database> {
    primary: D,
    reverse: D,
}

impl<D: Database> ExpiryIndex<D> {
    /// Opens both index structures, creating them when `create` is set (the
    /// master's privilege).
    pub fn open<E>(env: &E, create: bool) -> StoreResult<Self>
    where
        E: Environment<Db = D>,
    {
        let primary = env.open_db(PRIMARY_INDEX_DB, DbKind::Btree, create)?;
        let reverse = env.open_db(REVERSE_INDEX_DB, DbKind::Hash, create)?;
        Ok(Self { primary, reverse })
    }

    pub fn primary(&self) -> &D {
        &self.primary
    }

    pub fn reverse(&self) -> &D {
        &self.reverse
    }

    /// Registers `key` to expire at `stamp`.
    ///
    /// Writes the primary entry and overwrites the reverse entry inside `txn`;
    /// the caller commits both together.
    pub fn register(&self, txn: &D::Txn, key: &[u8], stamp: ExpiryStamp) -> StoreResult<()> {
        self.primary
            .put(Some(txn), &stamp.primary_key(key), key)
            .inspect_err(|e| warn!(op = "put|expire", code = e.code(), error = %e, "Failed to write expiry entry"))?;
        self.reverse
            .put(Some(txn), key, &stamp.encode())
            .inspect_err(|e| warn!(op = "put|index", code = e.code(), error = %e, "Failed to write expiry index entry"))?;
        Ok(())
    }

    /// The stamp currently governing `key`.
    pub fn current_stamp(
        &self,
        txn: Option<&D::Txn>,
        key: &[u8],
        lock: LockMode,
    ) -> StoreResult<ExpiryStamp> {
        let raw = self.reverse.get(txn, key, lock)?;
        ExpiryStamp::decode(&raw, self.reverse.name())
    }

    /// Validates one candidate against the reverse index and, if it is still
    /// current, deletes its data record.
    ///
    /// Runs in a transaction nested in `parent`. Not-found anywhere along the
    /// way is a successful no-op. Other errors abort the nested transaction;
    /// a dead table handle is also evicted from `tables`.
    pub fn validate_and_delete<E>(
        &self,
        env: &E,
        parent: &D::Txn,
        candidate: &PrimaryEntry,
        tables: &mut TableCache<D>,
    ) -> StoreResult<Verdict>
    where
        E: Environment<Db = D>,
    {
        let txn = parent.nested()?;
        let result = match self.validate_step(env, &txn, candidate, tables) {
            Err(e) if e.is_not_found() => Ok(Verdict::Missing),
            other => other,
        };

        match result {
            Ok(verdict) => {
                txn.commit()?;
                Ok(verdict)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(op = "abort", code = abort_err.code(), error = %abort_err, "Failed to abort validate transaction");
                }
                Err(e)
            }
        }
    }

    fn validate_step<E>(
        &self,
        env: &E,
        txn: &D::Txn,
        candidate: &PrimaryEntry,
        tables: &mut TableCache<D>,
    ) -> StoreResult<Verdict>
    where
        E: Environment<Db = D>,
    {
        let target = &candidate.target;
        let current = match self.current_stamp(Some(txn), target, LockMode::Write) {
            Ok(stamp) => stamp,
            Err(StoreError::NotFound) => {
                trace!(key = ?target, stamp = %candidate.stamp, "No registration left for key");
                return Ok(Verdict::Missing);
            }
            Err(e) => return Err(e),
        };
        if current != candidate.stamp {
            debug!(
                key = ?target,
                stale = %candidate.stamp,
                current = %current,
                "Registration superseded, keeping data"
            );
            return Ok(Verdict::Superseded { current });
        }

        match self.reverse.delete(Some(txn), target) {
            Ok(()) => {}
            Err(StoreError::NotFound) => return Ok(Verdict::LostRace),
            Err(e) => return Err(e),
        }

        let (table, name) = split_key(target);
        let db = match tables.resolve(env, &table) {
            Ok(db) => db,
            Err(StoreError::NoSuchDatabase(db)) => {
                debug!(db = %db, "Target table does not exist");
                return Ok(Verdict::TargetMissing);
            }
            Err(e) => return Err(e),
        };

        match db.delete(Some(txn), &name) {
            Ok(()) => Ok(Verdict::Reaped),
            Err(StoreError::NotFound) => Ok(Verdict::TargetMissing),
            Err(e) => {
                if e.is_handle_dead() {
                    tables.evict(&table);
                }
                Err(e)
            }
        }
    }

    /// Closes both handles.
    pub fn close(self) -> StoreResult<()> {
        let primary = self.primary.close();
        let reverse = self.reverse.close();
        primary.and(reverse)
    }
}

/// Registers a TTL for `key` as the write path does: one transaction holding
/// both index entries.
///
/// Returns the stamp that now governs the key.
pub fn register_ttl<E, C>(
    env: &E,
    index: &ExpiryIndex<E::Db>,
    clock: &C,
    key: &[u8],
    ttl_secs: u32,
    seq: u32,
    writer_id: u32,
) -> StoreResult<ExpiryStamp>
where
    E: Environment,
    C: Clock + ?Sized,
{
    let stamp = ExpiryStamp::after(clock.now_secs(), ttl_secs, seq, writer_id);
    let txn = env.begin(Isolation::ReadCommitted)?;
    match index.register(&txn, key, stamp) {
        Ok(()) => {
            txn.commit()?;
            Ok(stamp)
        }
        Err(e) => {
            if let Err(abort_err) = txn.abort() {
                warn!(op = "abort", code = abort_err.code(), error = %abort_err, "Failed to abort registration");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keyspace::table_db_name;
    use crate::storage::{MemDb, MemEnv};

    struct Fixture {
        env: MemEnv,
        index: ExpiryIndex<MemDb>,
        tables: TableCache<MemDb>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let env = MemEnv::new();
            let index = ExpiryIndex::open(&env, true).unwrap();
            Self {
                env,
                index,
                tables: TableCache::new(),
                clock: ManualClock::new(0),
            }
        }

        fn put_data(&self, table: &str, name: &str) {
            let db_name = table_db_name(table.as_bytes());
            self.env.create_db(&db_name, DbKind::Btree);
            let db = self.env.open_db(&db_name, DbKind::Unknown, false).unwrap();
            db.put(None, name.as_bytes(), b"value").unwrap();
        }

        fn register(&self, key: &str, ttl: u32, seq: u32) -> ExpiryStamp {
            register_ttl(&self.env, &self.index, &self.clock, key.as_bytes(), ttl, seq, 1).unwrap()
        }

        fn validate(&mut self, stamp: ExpiryStamp, key: &str) -> StoreResult<Verdict> {
            let candidate = PrimaryEntry {
                stamp,
                target: Bytes::copy_from_slice(key.as_bytes()),
            };
            let txn = self.env.begin(Isolation::ReadUncommitted).unwrap();
            let verdict = self
                .index
                .validate_and_delete(&self.env, &txn, &candidate, &mut self.tables);
            txn.commit().unwrap();
            verdict
        }

        fn has_data(&self, table: &str, name: &str) -> bool {
            self.env
                .peek(&table_db_name(table.as_bytes()), name.as_bytes())
                .is_some()
        }
    }

    #[test]
    fn test_register_writes_both_entries() {
        let fx = Fixture::new();
        fx.clock.set(100);
        let stamp = fx.register("orders:42", 5, 1);

        assert_eq!(stamp, ExpiryStamp::new(105, 1, 1));
        assert_eq!(
            fx.env.peek(PRIMARY_INDEX_DB, &stamp.primary_key(b"orders:42")),
            Some(Bytes::from("orders:42"))
        );
        assert_eq!(
            fx.index
                .current_stamp(None, b"orders:42", LockMode::Shared)
                .unwrap(),
            stamp
        );
    }

    #[test]
    fn test_reregister_supersedes_reverse_entry() {
        let fx = Fixture::new();
        let first = fx.register("orders:42", 1, 1);
        let second = fx.register("orders:42", 100, 2);

        assert_eq!(fx.env.len(PRIMARY_INDEX_DB), 2);
        assert_eq!(fx.env.len(REVERSE_INDEX_DB), 1);
        assert_ne!(first, second);
        assert_eq!(
            fx.index
                .current_stamp(None, b"orders:42", LockMode::Shared)
                .unwrap(),
            second
        );
    }

    #[test]
    fn test_validate_reaps_current_registration() {
        let mut fx = Fixture::new();
        fx.put_data("orders", "42");
        let stamp = fx.register("orders:42", 1, 1);

        assert_eq!(fx.validate(stamp, "orders:42"), Ok(Verdict::Reaped));
        assert!(!fx.has_data("orders", "42"));
        assert_eq!(fx.env.len(REVERSE_INDEX_DB), 0);
    }

    #[test]
    fn test_validate_superseded_keeps_data() {
        let mut fx = Fixture::new();
        fx.put_data("orders", "42");
        let stale = fx.register("orders:42", 1, 1);
        let current = fx.register("orders:42", 100, 2);

        assert_eq!(
            fx.validate(stale, "orders:42"),
            Ok(Verdict::Superseded { current })
        );
        assert!(fx.has_data("orders", "42"));
        assert_eq!(
            fx.index
                .current_stamp(None, b"orders:42", LockMode::Shared)
                .unwrap(),
            current
        );
    }

    #[test]
    fn test_validate_is_idempotent() {
        let mut fx = Fixture::new();
        fx.put_data("orders", "42");
        let stamp = fx.register("orders:42", 1, 1);

        assert_eq!(fx.validate(stamp, "orders:42"), Ok(Verdict::Reaped));
        assert_eq!(fx.validate(stamp, "orders:42"), Ok(Verdict::Missing));
        assert_eq!(fx.validate(stamp, "orders:42"), Ok(Verdict::Missing));
    }

    #[test]
    fn test_validate_data_already_deleted() {
        let mut fx = Fixture::new();
        fx.put_data("orders", "7");
        let stamp = fx.register("orders:42", 1, 1);

        assert_eq!(fx.validate(stamp, "orders:42"), Ok(Verdict::TargetMissing));
        assert!(fx.has_data("orders", "7"));
        assert_eq!(fx.env.len(REVERSE_INDEX_DB), 0);
    }

    #[test]
    fn test_validate_missing_table() {
        let mut fx = Fixture::new();
        let stamp = fx.register("ghost:1", 1, 1);

        assert_eq!(fx.validate(stamp, "ghost:1"), Ok(Verdict::TargetMissing));
        assert!(!fx.env.has_db("ghost.db"));
        assert_eq!(fx.env.len(REVERSE_INDEX_DB), 0);
    }

    #[test]
    fn test_validate_default_table() {
        let mut fx = Fixture::new();
        fx.put_data("__default", "session");
        let stamp = fx.register("session", 1, 1);

        assert_eq!(fx.validate(stamp, "session"), Ok(Verdict::Reaped));
        assert!(!fx.has_data("__default", "session"));
    }

    #[test]
    fn test_validate_dead_table_handle_is_evicted() {
        let mut fx = Fixture::new();
        fx.put_data("orders", "1");
        fx.put_data("orders", "2");
        let first = fx.register("orders:1", 1, 1);
        let second = fx.register("orders:2", 1, 2);

        assert_eq!(fx.validate(first, "orders:1"), Ok(Verdict::Reaped));
        assert!(fx.tables.find(b"orders").is_some());

        fx.env.kill_handles("orders.db");
        let err = fx.validate(second, "orders:2").unwrap_err();
        assert!(err.is_handle_dead());
        assert!(fx.tables.find(b"orders").is_none());

        // The failed attempt rolled back its reverse-index delete
        assert_eq!(
            fx.index
                .current_stamp(None, b"orders:2", LockMode::Shared)
                .unwrap(),
            second
        );
        assert!(fx.has_data("orders", "2"));

        // The next attempt reopens the table and succeeds
        assert_eq!(fx.validate(second, "orders:2"), Ok(Verdict::Reaped));
        assert!(!fx.has_data("orders", "2"));
    }

    #[test]
    fn test_validate_locked_key_fails() {
        let mut fx = Fixture::new();
        fx.put_data("orders", "42");
        let stamp = fx.register("orders:42", 1, 1);

        let writer = fx.env.begin(Isolation::ReadCommitted).unwrap();
        fx.index
            .reverse()
            .get(Some(&writer), b"orders:42", LockMode::Write)
            .unwrap();

        assert!(matches!(
            fx.validate(stamp, "orders:42"),
            Err(StoreError::LockNotGranted { .. })
        ));
        writer.commit().unwrap();
        assert_eq!(fx.validate(stamp, "orders:42"), Ok(Verdict::Reaped));
    }

    #[test]
    fn test_failed_registration_rolls_back() {
        let fx = Fixture::new();
        let current = fx.register("orders:42", 1, 1);

        let writer = fx.env.begin(Isolation::ReadCommitted).unwrap();
        fx.index
            .reverse()
            .get(Some(&writer), b"orders:42", LockMode::Write)
            .unwrap();

        let aborts = fx.env.aborts();
        let err = register_ttl(&fx.env, &fx.index, &fx.clock, b"orders:42", 50, 2, 1).unwrap_err();
        assert!(err.is_lock_conflict());
        assert_eq!(fx.env.aborts(), aborts + 1);

        // The primary entry written before the conflict is gone again
        assert_eq!(fx.env.len(PRIMARY_INDEX_DB), 1);
        writer.commit().unwrap();
        assert_eq!(
            fx.index
                .current_stamp(None, b"orders:42", LockMode::Shared)
                .unwrap(),
            current
        );
    }

    #[test]
    fn test_decode_primary_entry() {
        let stamp = ExpiryStamp::new(5, 1, 2);
        let value = Bytes::from("orders:42");
        let entry = PrimaryEntry::decode(&stamp.primary_key(b"orders:42"), &value).unwrap();
        assert_eq!(entry.stamp, stamp);
        assert_eq!(entry.target, value);
    }

    #[test]
    fn test_decode_malformed_primary_entry() {
        let value = Bytes::from("k");
        assert_eq!(
            PrimaryEntry::decode(b"short", &value).unwrap_err().code(),
            "malformed"
        );

        let stamp = ExpiryStamp::new(5, 1, 2);
        let mismatched = PrimaryEntry::decode(&stamp.primary_key(b"other"), &value);
        assert!(matches!(mismatched, Err(StoreError::Malformed { .. })));
    }
}
