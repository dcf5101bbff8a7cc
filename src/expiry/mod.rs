//! TTL expiration.
//!
//! - [`stamp`]: the ordered, fixed-width expiry timestamp
//! - [`index`]: the primary/reverse expiry index and validate-and-delete
//! - [`reaper`]: the background task that walks the index and reaps

pub mod index;
pub mod reaper;
pub mod stamp;

pub use index::{register_ttl, ExpiryIndex, PrimaryEntry, Verdict};
pub use reaper::{
    start_expiry_reaper, CycleEnd, CycleReport, ExpiryReaper, Reaper, ReaperState, ReaperStats,
    ReaperStatsSnapshot, TickOutcome,
};
pub use stamp::{ExpiryStamp, STAMP_LEN};
