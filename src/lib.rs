//! # reapkv - TTL Expiration for a Replicated Table Store
//!
//! reapkv is the expiration subsystem of an embedded, transactional key-value
//! store whose keys are partitioned into tables. Writers register a TTL for a
//! key; a single background reaper on the replication master deletes the
//! record once the TTL has passed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               reapkv                                 │
//! │                                                                      │
//! │  write path                            ┌──────────────────────────┐  │
//! │  register_ttl(key, ttl) ──────────────>│       ExpiryIndex        │  │
//! │                                        │ __expire.db  (by stamp)  │  │
//! │                                        │ __expire.index.db (key)  │  │
//! │                                        └────────────▲─────────────┘  │
//! │                                                     │ scan           │
//! │  ┌────────────┐  is_master/shutdown  ┌──────────────┴─────────────┐  │
//! │  │ RoleContext│─────────────────────>│     Reaper (tokio task)    │  │
//! │  └────────────┘                      └──────────────┬─────────────┘  │
//! │                                                     │ split_key      │
//! │                                      ┌──────────────▼─────────────┐  │
//! │                                      │  TableCache ─> <table>.db  │  │
//! │                                      └────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use reapkv::{register_ttl, start_expiry_reaper, ExpiryIndex, MemEnv, RoleContext, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let env = Arc::new(MemEnv::new());
//!     let role = RoleContext::new(true);
//!
//!     // The write path registers TTLs
//!     let index = ExpiryIndex::open(&*env, true)?;
//!     register_ttl(&*env, &index, &SystemClock, b"orders:42", 30, 1, 1)?;
//!
//!     // The reaper deletes orders:42 about 30 seconds later
//!     let reaper = start_expiry_reaper(Arc::clone(&env), &role);
//!
//!     tokio::signal::ctrl_c().await?;
//!     reaper.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`keyspace`]: splitting namespaced keys into table and record name
//! - [`storage`]: the storage engine interface, an in-memory engine and the
//!   table handle cache
//! - [`expiry`]: expiry stamps, the expiry index and the reaper
//! - [`role`]: replication role and shutdown flags
//! - [`clock`]: wall-clock source
//! - [`config`]: reaper tuning
//! - [`error`]: storage error kinds
//!
//! ## Design Highlights
//!
//! ### Lazy Invalidation
//!
//! Re-registering a key never searches for its old primary entry. The reverse
//! index always holds the current stamp, and the reaper discards any primary
//! entry whose stamp does not match it.
//!
//! ### Bounded Transactions
//!
//! A scan commits every `batch_cap` candidates and restarts its cursor, so a
//! large backlog never turns into one long lock-holding transaction.

pub mod clock;
pub mod config;
pub mod error;
pub mod expiry;
pub mod keyspace;
pub mod role;
pub mod storage;

// Re-export commonly used types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReaperConfig;
pub use error::{StoreError, StoreResult};
pub use expiry::{
    register_ttl, start_expiry_reaper, CycleReport, ExpiryIndex, ExpiryReaper, ExpiryStamp,
    Reaper, ReaperStatsSnapshot, TickOutcome, Verdict,
};
pub use keyspace::{join_key, split_key, DEFAULT_TABLE};
pub use role::{RoleContext, RoleGate, RoleState};
pub use storage::{Database, Environment, MemEnv, TableCache, Transaction};

/// Version of reapkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
