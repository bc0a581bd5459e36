//! The per-volume LEB-to-PEB mapping table, including the MLC
//! consolidation bookkeeping (classification lists, the `consolidated`
//! bitmap, and the shared [`ConsolidatedPeb`] records).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DeviceGeometry;
use crate::leb::{LebDesc, UNMAPPED};

/// A PEB shared by up to `pairing_groups` logical eraseblocks. Destroyed
/// once every slot is unmapped; kept alive by one `Arc` per slot that still
/// references it.
#[derive(Debug)]
pub struct ConsolidatedPeb {
    pub pnum: u32,
    /// `lnums[slot]` is the LEB occupying that slot, or `UNMAPPED`.
    pub lnums: Vec<u32>,
}

impl ConsolidatedPeb {
    fn valid_count(&self) -> usize {
        self.lnums.iter().filter(|&&l| l != UNMAPPED).count()
    }

    /// The lowest-index occupied slot, whose `lnum` is the list
    /// representative for this PEB.
    fn representative(&self) -> Option<(usize, u32)> {
        self.lnums
            .iter()
            .enumerate()
            .find(|(_, &l)| l != UNMAPPED)
            .map(|(slot, &l)| (slot, l))
    }
}

/// One entry of the EBA table.
#[derive(Debug, Clone)]
enum EbaCEntry {
    Unmapped,
    /// Occupies a whole PEB by itself.
    Single(u32),
    /// Occupies one slot of a shared, consolidated PEB.
    Consolidated { cpeb: Arc<Mutex<ConsolidatedPeb>>, slot: u32 },
}

/// Which classification list an entry belongs to. Only representative
/// entries of consolidated PEBs, and whole-PEB (`Single`) entries on MLC
/// media, are ever listed; slots other than the representative are not.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ListMembership {
    Open,
    ClosedClean,
    /// Index into `closed_dirty`; bucket `i` holds PEBs with `i + 1` valid
    /// slots remaining.
    ClosedDirty(usize),
}

/// Per-volume LEB-to-PEB mapping, plus MLC consolidation state.
///
/// On SLC media (`pairing_groups == 1`) every entry is always `Single` or
/// `Unmapped`; the classification lists stay empty and consolidation is
/// never attempted, mirroring how the original driver gates its whole
/// consolidation path behind a single per-device flag rather than using a
/// distinct data type.
pub struct EbaTable {
    geometry: DeviceGeometry,
    entries: Vec<EbaCEntry>,
    membership: Vec<Option<ListMembership>>,
    open: VecDeque<u32>,
    closed_clean: VecDeque<u32>,
    closed_dirty: Vec<VecDeque<u32>>,
    free_pebs: u32,
}

/// Instructs the caller what to do with a PEB once a mutation of the table
/// completes; kept separate so I/O (returning a PEB to the WL allocator)
/// never happens while `eba_lock` is held.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReleaseOutcome {
    pub released_peb: Option<u32>,
}

impl EbaTable {
    /// Build a table with `nlebs` entries, all unmapped, for a volume with
    /// `free_pebs` spare PEBs available before consolidation is forced.
    pub fn new(geometry: DeviceGeometry, nlebs: u32, free_pebs: u32) -> Self {
        let k = geometry.pairing_groups.max(1);
        Self {
            geometry,
            entries: vec![EbaCEntry::Unmapped; nlebs as usize],
            membership: vec![None; nlebs as usize],
            open: VecDeque::new(),
            closed_clean: VecDeque::new(),
            closed_dirty: (0..k.saturating_sub(1)).map(|_| VecDeque::new()).collect(),
            free_pebs,
        }
    }

    pub fn is_mlc(&self) -> bool {
        self.geometry.is_mlc()
    }

    pub fn free_pebs(&self) -> u32 {
        self.free_pebs
    }

    pub fn nlebs(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Fetch the current physical location of `lnum`.
    pub fn get_ldesc(&self, lnum: u32) -> LebDesc {
        match &self.entries[lnum as usize] {
            EbaCEntry::Unmapped => LebDesc::unmapped(lnum),
            EbaCEntry::Single(pnum) => LebDesc {
                lnum,
                pnum: *pnum,
                lpos: -1,
            },
            EbaCEntry::Consolidated { cpeb, slot } => LebDesc {
                lnum,
                pnum: cpeb.lock().pnum,
                lpos: *slot as i32,
            },
        }
    }

    /// Map `lnum` onto a whole PEB (SLC entries, and MLC entries before
    /// they are ever consolidated).
    pub fn set_pnum(&mut self, lnum: u32, pnum: u32) {
        debug_assert!(!matches!(
            self.entries[lnum as usize],
            EbaCEntry::Consolidated { .. }
        ));
        self.entries[lnum as usize] = EbaCEntry::Single(pnum);
        if self.is_mlc() {
            self.unlink(lnum);
            self.open.push_back(lnum);
            self.membership[lnum as usize] = Some(ListMembership::Open);
        }
    }

    fn unlink(&mut self, lnum: u32) {
        match self.membership[lnum as usize].take() {
            Some(ListMembership::Open) => remove_first(&mut self.open, lnum),
            Some(ListMembership::ClosedClean) => remove_first(&mut self.closed_clean, lnum),
            Some(ListMembership::ClosedDirty(bucket)) => {
                remove_first(&mut self.closed_dirty[bucket], lnum)
            }
            None => {}
        }
    }

    /// Re-link a consolidated PEB's representative LEB into the bucket
    /// matching how many valid slots it has left.
    fn relink_representative(&mut self, cpeb: &Arc<Mutex<ConsolidatedPeb>>) {
        let (slot, representative) = match cpeb.lock().representative() {
            Some(x) => x,
            None => return,
        };
        let valid = cpeb.lock().valid_count();

        self.unlink(representative);
        self.entries[representative as usize] = EbaCEntry::Consolidated {
            cpeb: cpeb.clone(),
            slot: slot as u32,
        };

        let k = self.geometry.pairing_groups.max(1) as usize;
        if valid == k {
            self.closed_clean.push_back(representative);
            self.membership[representative as usize] = Some(ListMembership::ClosedClean);
        } else {
            let bucket = valid - 1;
            self.closed_dirty[bucket].push_back(representative);
            self.membership[representative as usize] = Some(ListMembership::ClosedDirty(bucket));
        }
    }

    /// Install a brand new consolidated PEB, with every slot pointing back
    /// at it. Called by the consolidator once it finalizes.
    ///
    /// Returns the PEBs each participating LEB used to occupy by itself;
    /// the caller must hand these back to WL once this table's lock is
    /// released (§4.6 finalizing: "Decrement `free_pebs` by one (the newly
    /// consumed PEB)" — the source PEBs are a separate release, reported
    /// here rather than performed directly since this table has no access
    /// to the device).
    pub fn install_consolidated(&mut self, lnums: Vec<u32>, pnum: u32) -> Vec<u32> {
        let cpeb = Arc::new(Mutex::new(ConsolidatedPeb {
            pnum,
            lnums: lnums.clone(),
        }));

        let mut vacated_pebs = Vec::new();
        for (slot, &lnum) in lnums.iter().enumerate() {
            if lnum == UNMAPPED {
                continue;
            }
            self.unlink(lnum);
            if let EbaCEntry::Single(old_pnum) = self.entries[lnum as usize] {
                vacated_pebs.push(old_pnum);
            }
            self.entries[lnum as usize] = EbaCEntry::Consolidated {
                cpeb: cpeb.clone(),
                slot: slot as u32,
            };
        }

        self.relink_representative(&cpeb);
        self.dec_free_pebs();
        vacated_pebs
    }

    /// Invalidate `lnum`'s current mapping, following §4.3's invalidation
    /// protocol. Returns the PEB that should now be handed back to WL, if
    /// any — the caller must do that outside of any lock this table is
    /// held under.
    pub fn invalidate(&mut self, lnum: u32) -> ReleaseOutcome {
        match self.entries[lnum as usize].clone() {
            EbaCEntry::Unmapped => ReleaseOutcome { released_peb: None },
            EbaCEntry::Single(pnum) => {
                self.unlink(lnum);
                self.entries[lnum as usize] = EbaCEntry::Unmapped;
                ReleaseOutcome {
                    released_peb: Some(pnum),
                }
            }
            EbaCEntry::Consolidated { cpeb, slot } => {
                // The representative entry (not necessarily `lnum` itself)
                // is the one linked into a classification list; unlink it
                // before mutating slot occupancy.
                let representative_before = cpeb.lock().representative().map(|(_, l)| l);
                if let Some(representative) = representative_before {
                    self.unlink(representative);
                }

                let pnum = {
                    let mut guard = cpeb.lock();
                    guard.lnums[slot as usize] = UNMAPPED;
                    guard.pnum
                };
                self.entries[lnum as usize] = EbaCEntry::Unmapped;

                let remaining = cpeb.lock().valid_count();
                if remaining == 0 {
                    ReleaseOutcome {
                        released_peb: Some(pnum),
                    }
                } else {
                    self.relink_representative(&cpeb);
                    ReleaseOutcome { released_peb: None }
                }
            }
        }
    }

    /// Record a successful write to a non-consolidated LEB: move it to the
    /// front of the consolidation candidate queue and cancel any
    /// in-progress consolidation that had already selected it.
    pub fn mark_updated(&mut self, lnum: u32) {
        if !self.is_mlc() {
            return;
        }
        debug_assert!(matches!(
            self.entries[lnum as usize],
            EbaCEntry::Single(_)
        ));
        self.unlink(lnum);
        self.open.push_back(lnum);
        self.membership[lnum as usize] = Some(ListMembership::Open);
    }

    /// Prefer a PEB with exactly one valid LEB remaining (consolidating it
    /// frees a whole PEB outright); fall back to the oldest `open` entry.
    /// Never selects an already fully consolidated, clean PEB.
    pub fn select_leb_for_consolidation(&self) -> Option<u32> {
        if let Some(bucket) = self.closed_dirty.first() {
            if let Some(&lnum) = bucket.front() {
                return Some(lnum);
            }
        }
        self.open.front().copied()
    }

    /// Remove `lnum` from whichever classification list it sits in, without
    /// changing its mapping. Used by the consolidator to keep a LEB it has
    /// already selected from being selected again for the next slot.
    pub fn reserve_for_consolidation(&mut self, lnum: u32) {
        self.unlink(lnum);
    }

    /// Undo [`EbaTable::reserve_for_consolidation`] after a cancelled
    /// consolidation: the LEB's data and mapping are unchanged, so it goes
    /// back to `open` rather than wherever it originally was classified.
    pub fn requeue_after_cancel(&mut self, lnum: u32) {
        self.unlink(lnum);
        self.open.push_back(lnum);
        self.membership[lnum as usize] = Some(ListMembership::Open);
    }

    pub fn set_free_pebs(&mut self, free_pebs: u32) {
        self.free_pebs = free_pebs;
    }

    pub fn dec_free_pebs(&mut self) {
        self.free_pebs = self.free_pebs.saturating_sub(1);
    }

    pub fn inc_free_pebs(&mut self) {
        self.free_pebs += 1;
    }

    #[cfg(test)]
    fn list_of(&self, lnum: u32) -> Option<ListMembership> {
        self.membership[lnum as usize]
    }
}

fn remove_first(list: &mut VecDeque<u32>, value: u32) {
    if let Some(pos) = list.iter().position(|&x| x == value) {
        list.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(pairing_groups: u32) -> DeviceGeometry {
        DeviceGeometry {
            leb_size: 64,
            min_io_size: 8,
            vid_hdr_offset: 0,
            leb_start: 0,
            pairing_groups,
            eba_reserved_pebs: 1,
            io_retries: 3,
        }
    }

    #[test]
    fn slc_table_never_consolidates() {
        let mut table = EbaTable::new(geometry(1), 4, 10);
        table.set_pnum(0, 5);
        assert_eq!(table.select_leb_for_consolidation(), None);
        assert_eq!(table.get_ldesc(0).lpos, -1);
    }

    #[test]
    fn consolidation_links_representative_into_clean_bucket() {
        let mut table = EbaTable::new(geometry(4), 8, 10);
        table.set_pnum(0, 100); // goes to `open`, cleared below
        table.install_consolidated(vec![0, 1, 2, 3], 200);
        assert_eq!(table.list_of(0), Some(ListMembership::ClosedClean));
        assert_eq!(table.get_ldesc(0).pnum, 200);
        assert_eq!(table.get_ldesc(1).lpos, 1);
    }

    #[test]
    fn invalidating_one_slot_moves_representative_to_dirty_bucket() {
        let mut table = EbaTable::new(geometry(4), 8, 10);
        table.install_consolidated(vec![0, 1, 2, 3], 200);
        let outcome = table.invalidate(0);
        assert_eq!(outcome.released_peb, None);
        // slot 0 is gone; lnum 1 is now the representative with 3 valid slots.
        assert_eq!(table.list_of(1), Some(ListMembership::ClosedDirty(2)));
        assert!(table.get_ldesc(0).pnum == UNMAPPED || !table.get_ldesc(0).is_mapped());
    }

    #[test]
    fn invalidating_last_slot_releases_the_peb() {
        let mut table = EbaTable::new(geometry(2), 4, 10);
        table.install_consolidated(vec![0, 1], 200);
        assert_eq!(table.invalidate(0).released_peb, None);
        assert_eq!(table.invalidate(1).released_peb, Some(200));
    }

    #[test]
    fn single_leb_invalidate_releases_its_peb() {
        let mut table = EbaTable::new(geometry(1), 4, 10);
        table.set_pnum(2, 7);
        assert_eq!(table.invalidate(2).released_peb, Some(7));
        assert!(!table.get_ldesc(2).is_mapped());
    }

    #[test]
    fn select_prefers_a_single_valid_slot_peb_over_open() {
        let mut table = EbaTable::new(geometry(4), 8, 10);
        table.set_pnum(5, 50); // lands in `open`
        table.install_consolidated(vec![0, 1, 2, 3], 200);
        table.invalidate(0);
        table.invalidate(1);
        table.invalidate(2); // lnum 3 is now the only valid slot -> dirty[0]
        assert_eq!(table.select_leb_for_consolidation(), Some(3));
    }

    #[test]
    fn select_falls_back_to_open_when_no_single_slot_peb_exists() {
        let mut table = EbaTable::new(geometry(4), 8, 10);
        table.set_pnum(5, 50); // lands in `open`
        table.install_consolidated(vec![0, 1, 2, 3], 200);
        table.invalidate(0); // lnum 1 has 3 valid slots -> dirty[2], not dirty[0]
        assert_eq!(table.select_leb_for_consolidation(), Some(5));
    }
}
