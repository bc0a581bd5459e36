//! Monotonic sequence numbers stamped into every VID header.

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues strictly increasing sqnums for VID headers.
///
/// Every producer of a VID header (`write_leb`, `write_leb_static`,
/// `atomic_leb_change`, `recover_peb`, the consolidator, `copy_peb`) must
/// draw its `sqnum` from the same counter, so that attach can resolve which
/// of two PEBs claiming the same `(vol_id, lnum)` is the newer one.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Start a fresh counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a counter after attach, seeded with the highest sqnum found on
    /// media so any newly issued sqnum is still strictly greater.
    pub fn resume_from(highest_seen: u64) -> Self {
        Self {
            next: AtomicU64::new(highest_seen + 1),
        }
    }

    /// Draw the next sqnum. Never blocks, never fails.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Advance the counter so the next issued sqnum is strictly greater than
    /// `highest_seen`, never moving it backward. Used by attach to resume
    /// the sequence after an external scan reports the highest sqnum found
    /// on media (I1: every produced sqnum must exceed every sqnum already
    /// persisted, including ones written before this process started).
    pub fn ensure_past(&self, highest_seen: u64) {
        self.next.fetch_max(highest_seen + 1, Ordering::SeqCst);
    }
}
