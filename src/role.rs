//! Replication Role Gate
//!
//! Only a replication master may reap; a standby must leave the expiry index
//! alone because its copy is driven by the master's log. The process's
//! lifecycle manager owns the two flags that decide this:
//!
//! - `is_master`: flips on elections and demotions
//! - `shutdown_requested`: set once, never cleared
//!
//! [`RoleContext`] is the writer side and can be cloned freely. The reaper
//! holds a [`RoleGate`], reads a [`RoleState`] snapshot each tick and sleeps
//! on the gate so a role change or shutdown wakes it early.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Snapshot of the externally maintained role flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleState {
    pub is_master: bool,
    pub shutdown_requested: bool,
}

/// Writer side of the role flags, held by the replication/lifecycle manager.
#[derive(Debug, Clone)]
pub struct RoleContext {
    tx: Arc<watch::Sender<RoleState>>,
}

impl RoleContext {
    pub fn new(is_master: bool) -> Self {
        let (tx, _) = watch::channel(RoleState {
            is_master,
            shutdown_requested: false,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Records a role transition.
    pub fn set_master(&self, is_master: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.is_master == is_master {
                return false;
            }
            state.is_master = is_master;
            true
        });
        if changed {
            info!(is_master, "Replication role changed");
        }
    }

    /// Asks every gate holder to stop. Irreversible.
    pub fn request_shutdown(&self) {
        self.tx.send_if_modified(|state| {
            if state.shutdown_requested {
                return false;
            }
            state.shutdown_requested = true;
            true
        });
    }

    pub fn snapshot(&self) -> RoleState {
        *self.tx.borrow()
    }

    /// Creates a reader for the reaper.
    pub fn gate(&self) -> RoleGate {
        RoleGate {
            rx: self.tx.subscribe(),
            orphaned: false,
        }
    }
}

/// Reader side of the role flags.
#[derive(Debug)]
pub struct RoleGate {
    rx: watch::Receiver<RoleState>,
    /// Set once every `RoleContext` is gone; treated as a shutdown request
    orphaned: bool,
}

impl RoleGate {
    /// Current flags.
    pub fn snapshot(&self) -> RoleState {
        let mut state = *self.rx.borrow();
        if self.orphaned || self.rx.has_changed().is_err() {
            state.shutdown_requested = true;
        }
        state
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.snapshot().shutdown_requested
    }

    /// Sleeps for `period`, waking early if the flags change.
    pub async fn sleep(&mut self, period: Duration) {
        if self.orphaned {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            result = self.rx.changed() => {
                if result.is_err() {
                    self.orphaned = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_snapshot_tracks_context() {
        let role = RoleContext::new(false);
        let gate = role.gate();
        assert_eq!(gate.snapshot(), RoleState::default());

        role.set_master(true);
        assert!(gate.snapshot().is_master);
        assert!(!gate.shutdown_requested());

        role.request_shutdown();
        assert!(gate.shutdown_requested());
        assert!(role.snapshot().shutdown_requested);
    }

    #[test]
    fn test_dropped_context_means_shutdown() {
        let role = RoleContext::new(true);
        let gate = role.gate();
        drop(role);

        assert!(gate.shutdown_requested());
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_change() {
        let role = RoleContext::new(false);
        let mut gate = role.gate();

        let waker = role.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.request_shutdown();
        });

        let started = Instant::now();
        gate.sleep(Duration::from_secs(10)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(gate.shutdown_requested());
    }

    #[tokio::test]
    async fn test_sleep_runs_full_period_without_change() {
        let role = RoleContext::new(true);
        let mut gate = role.gate();

        let started = Instant::now();
        gate.sleep(Duration::from_millis(30)).await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!gate.shutdown_requested());
    }
}
