//! Background Expiry Reaper
//!
//! The reaper is the single task that deletes expired records. Each tick it
//! walks the primary expiry index in time order, validates every due entry
//! against the reverse index and deletes the data record the entry governs.
//!
//! ## State Machine
//!
//! ```text
//!              not master / after a cycle
//!         ┌──────────────────────────────────┐
//!         ▼                                  │
//!     ┌────────┐  master, no handles   ┌─────┴──────────┐
//!     │  Idle  │──────────────────────>│ OpeningHandles │──┐ retry with
//!     └───┬────┘                       └───────┬────────┘<─┘ backoff
//!         │ master, handles open               │ opened
//!         ▼                                    ▼
//!     ┌──────────┐ <───────────────────────────┘
//!     │ Scanning │── unrecoverable error: drop index handles
//!     └──────────┘
//!
//!     shutdown requested (any state) ──> exit
//! ```
//!
//! ## Scan Cycle
//!
//! A cycle is a series of batches. Each batch is one transaction with a fresh
//! cursor over the primary index, and processes at most `batch_cap`
//! candidates before committing so a large backlog never holds locks for
//! long. A batch ends when the index is exhausted, when the next entry is not
//! yet due (everything after it is later still), when shutdown is requested,
//! or when the cap is hit (in which case the next batch starts right away).
//!
//! Work is committed, never rolled back, on shutdown. A per-candidate error
//! other than not-found aborts the current batch and fails the cycle; the
//! tick then drops both index handles so they are reopened next time. A lock
//! held by a foreground writer also fails the cycle but keeps the handles:
//! the candidate is simply retried on the next tick.

use crate::clock::{Clock, SystemClock};
use crate::config::ReaperConfig;
use crate::error::{StoreError, StoreResult};
use crate::expiry::index::{ExpiryIndex, PrimaryEntry, Verdict};
use crate::role::{RoleContext, RoleGate};
use crate::storage::{Cursor, Database, Environment, TableCache, Transaction, PRIMARY_INDEX_DB};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Where the reaper is in its tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    /// Not master, between cycles, or shutting down
    Idle,
    /// Retrying to open the expiry index
    OpeningHandles,
    /// Walking the primary index
    Scanning,
}

/// Why a scan cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleEnd {
    /// Nothing left in the primary index
    #[default]
    Exhausted,
    /// The next entry is due at `next_due`
    NotDue { next_due: i64 },
    /// Shutdown was requested mid-cycle
    Shutdown,
}

/// What one scan cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Transactions the cycle committed
    pub batches: u32,
    /// Due entries visited
    pub candidates: u64,
    pub reaped: u64,
    pub target_missing: u64,
    pub missing: u64,
    pub superseded: u64,
    pub lost_races: u64,
    pub end: CycleEnd,
}

impl CycleReport {
    fn absorb(&mut self, batch: &BatchTally) {
        self.batches += 1;
        self.candidates += batch.candidates;
        self.reaped += batch.reaped;
        self.target_missing += batch.target_missing;
        self.missing += batch.missing;
        self.superseded += batch.superseded;
        self.lost_races += batch.lost_races;
    }
}

/// Counters for one batch; folded into the report only once it commits.
#[derive(Debug, Default)]
struct BatchTally {
    candidates: u64,
    reaped: u64,
    target_missing: u64,
    missing: u64,
    superseded: u64,
    lost_races: u64,
}

impl BatchTally {
    fn record(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Reaped => self.reaped += 1,
            Verdict::TargetMissing => self.target_missing += 1,
            Verdict::Missing => self.missing += 1,
            Verdict::Superseded { .. } => self.superseded += 1,
            Verdict::LostRace => self.lost_races += 1,
        }
    }
}

enum BatchEnd {
    CapReached,
    Finished(CycleEnd),
}

/// Outcome of a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Shutdown was requested; the loop should exit
    Shutdown,
    /// Not master; nothing was scanned
    Standby,
    /// The expiry index could not be opened before the role changed
    Unavailable,
    /// A cycle ran to completion
    Scanned(CycleReport),
    /// A cycle failed. The index handles were dropped unless the failure
    /// was a lock conflict
    Failed(StoreError),
}

/// Statistics for the reaper, shared with its [`ExpiryReaper`] handle.
#[derive(Debug, Default)]
pub struct ReaperStats {
    ticks: AtomicU64,
    cycles: AtomicU64,
    batches: AtomicU64,
    candidates: AtomicU64,
    reaped: AtomicU64,
    target_missing: AtomicU64,
    missing: AtomicU64,
    superseded: AtomicU64,
    lost_races: AtomicU64,
    cycle_failures: AtomicU64,
    lock_conflicts: AtomicU64,
    open_failures: AtomicU64,
    index_opens: AtomicU64,
    max_batch: AtomicU64,
}

/// Point-in-time copy of [`ReaperStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStatsSnapshot {
    pub ticks: u64,
    pub cycles: u64,
    pub batches: u64,
    pub candidates: u64,
    pub reaped: u64,
    pub target_missing: u64,
    pub missing: u64,
    pub superseded: u64,
    pub lost_races: u64,
    pub cycle_failures: u64,
    /// Cycles cut short by a key another transaction held locked
    pub lock_conflicts: u64,
    pub open_failures: u64,
    pub index_opens: u64,
    /// Most candidates any single batch transaction processed
    pub max_batch: u64,
}

impl ReaperStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ReaperStatsSnapshot {
        ReaperStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            target_missing: self.target_missing.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            cycle_failures: self.cycle_failures.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            index_opens: self.index_opens.load(Ordering::Relaxed),
            max_batch: self.max_batch.load(Ordering::Relaxed),
        }
    }

    fn record_batch(&self, batch: &BatchTally) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.candidates.fetch_add(batch.candidates, Ordering::Relaxed);
        self.reaped.fetch_add(batch.reaped, Ordering::Relaxed);
        self.target_missing
            .fetch_add(batch.target_missing, Ordering::Relaxed);
        self.missing.fetch_add(batch.missing, Ordering::Relaxed);
        self.superseded.fetch_add(batch.superseded, Ordering::Relaxed);
        self.lost_races.fetch_add(batch.lost_races, Ordering::Relaxed);
        self.max_batch.fetch_max(batch.candidates, Ordering::Relaxed);
    }
}

/// The expiry reaper.
///
/// Owns the expiry index handles and the table handle cache; nothing else
/// touches them. Drive it with [`Reaper::run`] (usually through
/// [`ExpiryReaper::start`]) or one [`Reaper::tick`] at a time.
pub struct Reaper<E: Environment> {
    env: Arc<E>,
    clock: Arc<dyn Clock>,
    gate: RoleGate,
    config: ReaperConfig,
    index: Option<ExpiryIndex<E::Db>>,
    tables: TableCache<E::Db>,
    state: ReaperState,
    stats: Arc<ReaperStats>,
}

impl<E: Environment> std::fmt::Debug for Reaper<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("state", &self.state)
            .field("index_open", &self.index.is_some())
            .field("cached_tables", &self.tables.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<E: Environment> Reaper<E> {
    /// Creates a reaper reading the system clock.
    pub fn new(env: Arc<E>, gate: RoleGate, config: ReaperConfig) -> Self {
        Self {
            env,
            clock: Arc::new(SystemClock),
            gate,
            config,
            index: None,
            tables: TableCache::new(),
            state: ReaperState::Idle,
            stats: Arc::new(ReaperStats::new()),
        }
    }

    /// Replaces the clock expiry decisions are made against.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> ReaperState {
        self.state
    }

    pub fn stats(&self) -> Arc<ReaperStats> {
        Arc::clone(&self.stats)
    }

    /// Returns true while the expiry index handles are open.
    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Number of table handles currently cached.
    pub fn cached_tables(&self) -> usize {
        self.tables.len()
    }

    /// Runs ticks until shutdown is requested, then closes every handle.
    pub async fn run(mut self) -> ReaperStatsSnapshot {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            batch_cap = self.config.batch_cap,
            "Expiry reaper started"
        );

        loop {
            if self.tick().await == TickOutcome::Shutdown || self.gate.shutdown_requested() {
                break;
            }
            self.gate.sleep(self.config.tick_interval).await;
        }

        self.close();
        let stats = self.stats.snapshot();
        info!(
            cycles = stats.cycles,
            reaped = stats.reaped,
            superseded = stats.superseded,
            failures = stats.cycle_failures,
            "Expiry reaper stopped"
        );
        stats
    }

    /// Runs one tick: gate on the role, make sure the index is open, scan.
    pub async fn tick(&mut self) -> TickOutcome {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let role = self.gate.snapshot();
        if role.shutdown_requested {
            self.set_state(ReaperState::Idle);
            return TickOutcome::Shutdown;
        }
        if !role.is_master {
            self.set_state(ReaperState::Idle);
            trace!("Not master, skipping expiry scan");
            return TickOutcome::Standby;
        }

        if self.index.is_none() && !self.open_index().await {
            self.set_state(ReaperState::Idle);
            return if self.gate.shutdown_requested() {
                TickOutcome::Shutdown
            } else {
                TickOutcome::Unavailable
            };
        }

        self.set_state(ReaperState::Scanning);
        let outcome = match self.scan_cycle().await {
            Ok(report) => {
                if report.candidates > 0 {
                    debug!(
                        reaped = report.reaped,
                        superseded = report.superseded,
                        missing = report.missing + report.target_missing,
                        batches = report.batches,
                        "Expired keys reaped"
                    );
                }
                TickOutcome::Scanned(report)
            }
            Err(e) if e.is_lock_conflict() => {
                warn!(
                    op = "expire_check",
                    code = e.code(),
                    error = %e,
                    "Expiry scan hit a locked key, retrying next tick"
                );
                self.stats.lock_conflicts.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Failed(e)
            }
            Err(e) => {
                error!(
                    op = "expire_check",
                    code = e.code(),
                    error = %e,
                    "Expiry scan failed, reopening expiry index"
                );
                self.stats.cycle_failures.fetch_add(1, Ordering::Relaxed);
                self.drop_index();
                TickOutcome::Failed(e)
            }
        };
        self.set_state(ReaperState::Idle);
        outcome
    }

    fn set_state(&mut self, state: ReaperState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "Reaper state change");
            self.state = state;
        }
    }

    /// Opens the expiry index, retrying at a fixed backoff until it succeeds,
    /// the master role is lost, or shutdown is requested.
    async fn open_index(&mut self) -> bool {
        self.set_state(ReaperState::OpeningHandles);
        loop {
            let role = self.gate.snapshot();
            if role.shutdown_requested || !role.is_master {
                return false;
            }

            match ExpiryIndex::open(&*self.env, role.is_master) {
                Ok(index) => {
                    self.stats.index_opens.fetch_add(1, Ordering::Relaxed);
                    debug!("Opened expiry index");
                    self.index = Some(index);
                    return true;
                }
                Err(e) => {
                    self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                    let backoff_ms = self.config.open_backoff.as_millis() as u64;
                    if e.is_retryable() {
                        warn!(op = "open", code = e.code(), error = %e, backoff_ms, "Could not open expiry index");
                    } else {
                        error!(op = "open", code = e.code(), error = %e, backoff_ms, "Expiry index open failed unexpectedly");
                    }
                    self.gate.sleep(self.config.open_backoff).await;
                }
            }
        }
    }

    /// Runs batches until one finishes the cycle, yielding to the runtime
    /// between batches.
    async fn scan_cycle(&mut self) -> StoreResult<CycleReport> {
        let now = self.clock.now_secs();
        let mut report = CycleReport::default();

        loop {
            match self.scan_batch(now, &mut report)? {
                BatchEnd::CapReached => {
                    trace!(batches = report.batches, "Batch cap reached, restarting cursor");
                    tokio::task::yield_now().await;
                }
                BatchEnd::Finished(end) => {
                    report.end = end;
                    break;
                }
            }
        }

        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    /// One transaction, one cursor, at most `batch_cap` candidates.
    fn scan_batch(&mut self, now: i64, report: &mut CycleReport) -> StoreResult<BatchEnd> {
        let Self {
            env,
            gate,
            config,
            index,
            tables,
            stats,
            ..
        } = self;
        let index = index
            .as_ref()
            .ok_or_else(|| StoreError::NotReady(PRIMARY_INDEX_DB.to_string()))?;

        // A zero cap would never read an entry
        let batch_cap = config.batch_cap.max(1);
        let txn = env.begin(config.cursor_isolation)?;
        let mut tally = BatchTally::default();
        let walked = walk_batch(&**env, index, tables, gate, &txn, now, batch_cap, &mut tally);

        match walked {
            Ok(end) => {
                txn.commit()?;
                report.absorb(&tally);
                stats.record_batch(&tally);
                Ok(end)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(
                        op = "abort",
                        code = abort_err.code(),
                        error = %abort_err,
                        "Failed to abort scan transaction"
                    );
                }
                Err(e)
            }
        }
    }

    fn drop_index(&mut self) {
        if let Some(index) = self.index.take() {
            if let Err(e) = index.close() {
                warn!(op = "close", code = e.code(), error = %e, "Failed to close expiry index");
            }
        }
    }

    /// Closes the index handles and every cached table handle.
    fn close(&mut self) {
        self.drop_index();
        self.tables.drain();
        self.set_state(ReaperState::Idle);
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_batch<E: Environment>(
    env: &E,
    index: &ExpiryIndex<E::Db>,
    tables: &mut TableCache<E::Db>,
    gate: &RoleGate,
    txn: &E::Txn,
    now: i64,
    batch_cap: usize,
    tally: &mut BatchTally,
) -> StoreResult<BatchEnd> {
    let mut cursor = index.primary().cursor(txn)?;

    loop {
        if gate.shutdown_requested() {
            debug!("Shutdown requested, committing partial expiry scan");
            return Ok(BatchEnd::Finished(CycleEnd::Shutdown));
        }
        if tally.candidates >= batch_cap as u64 {
            return Ok(BatchEnd::CapReached);
        }

        let Some((key, value)) = cursor.next()? else {
            return Ok(BatchEnd::Finished(CycleEnd::Exhausted));
        };
        let entry = PrimaryEntry::decode(&key, &value)?;
        if !entry.stamp.is_due(now) {
            return Ok(BatchEnd::Finished(CycleEnd::NotDue {
                next_due: entry.stamp.expire_at,
            }));
        }

        tally.candidates += 1;
        let verdict = index
            .validate_and_delete(env, txn, &entry, tables)
            .inspect_err(|e| {
                error!(
                    op = "expire_check_one",
                    code = e.code(),
                    error = %e,
                    key = ?entry.target,
                    "Could not reap expired key"
                )
            })?;
        trace!(key = ?entry.target, stamp = %entry.stamp, ?verdict, "Candidate processed");
        tally.record(verdict);

        match cursor.delete_current() {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
}

/// A handle to a running reaper task.
///
/// The reaper stops when the process shutdown flag on its [`RoleContext`] is
/// raised. [`ExpiryReaper::stop`] raises it, and so does dropping the handle.
#[derive(Debug)]
pub struct ExpiryReaper {
    role: RoleContext,
    stats: Arc<ReaperStats>,
    task: Option<JoinHandle<ReaperStatsSnapshot>>,
}

impl ExpiryReaper {
    /// Spawns `reaper` as a background task.
    ///
    /// `role` must be the context the reaper's gate was taken from.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use reapkv::{ExpiryReaper, MemEnv, Reaper, ReaperConfig, RoleContext};
    /// use std::sync::Arc;
    ///
    /// let env = Arc::new(MemEnv::new());
    /// let role = RoleContext::new(true);
    /// let reaper = Reaper::new(env, role.gate(), ReaperConfig::default());
    /// let handle = ExpiryReaper::start(reaper, role.clone());
    ///
    /// // Reaper runs in the background...
    ///
    /// let stats = handle.shutdown().await;
    /// ```
    pub fn start<E: Environment>(reaper: Reaper<E>, role: RoleContext) -> Self {
        let stats = reaper.stats();
        let task = tokio::spawn(reaper.run());

        info!("Background expiry reaper spawned");

        Self {
            role,
            stats,
            task: Some(task),
        }
    }

    pub fn stats(&self) -> ReaperStatsSnapshot {
        self.stats.snapshot()
    }

    /// Requests shutdown without waiting for the task.
    pub fn stop(&self) {
        self.role.request_shutdown();
    }

    /// Requests shutdown and waits for the task to close its handles.
    pub async fn shutdown(mut self) -> ReaperStatsSnapshot {
        self.stop();
        match self.task.take() {
            Some(task) => match task.await {
                Ok(stats) => stats,
                Err(e) => {
                    error!(error = %e, "Expiry reaper task failed");
                    self.stats.snapshot()
                }
            },
            None => self.stats.snapshot(),
        }
    }
}

impl Drop for ExpiryReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts a reaper with default configuration on the system clock.
pub fn start_expiry_reaper<E: Environment>(env: Arc<E>, role: &RoleContext) -> ExpiryReaper {
    let reaper = Reaper::new(env, role.gate(), ReaperConfig::default());
    ExpiryReaper::start(reaper, role.clone())
}
